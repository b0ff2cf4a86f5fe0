//! Markdown tokenizer for converter output.
//!
//! Splits the converter's markdown into a stream of [`Token`]s (text
//! runs, inline base64 images, and "loose" tables), each labelled with
//! the last heading seen. Two mandatory post-passes then merge adjacent
//! text runs and re-join tables the converter broke across fragments.
//!
//! Recognition is line-oriented:
//!
//! - an image is any line embedding `](data:image/…;base64,<payload>)`;
//! - a table is detected from its separator row (`|---|---|`); rows are
//!   collected upward until a non-table line and downward the same way,
//!   preserving source order;
//! - heading lines (`#`, `##`, …) update the running section label;
//! - everything else accumulates into a text buffer, flushed by any
//!   non-text token or at end of input.

/// One table row as a `(key, value)` cell pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub key: String,
    pub value: String,
}

/// A tokenized fragment of converter markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text {
        content: String,
        section: String,
    },
    Image {
        base64: String,
        section: String,
    },
    Table {
        rows: Vec<TableRow>,
        section: String,
        /// Whether rows were collected above the separator. A fragment
        /// whose separator had nothing above it is a continuation of the
        /// previous table and is merged into it.
        header: bool,
    },
}

/// Tokenize a markdown document and run both merge passes.
pub fn tokenize(markdown: &str) -> Vec<Token> {
    let tokens = scan(markdown);
    merge_adjacent_tables(merge_adjacent_text(tokens))
}

fn scan(markdown: &str) -> Vec<Token> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut tokens = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut section = String::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(heading) = heading_text(line) {
            flush_text(&mut tokens, &mut pending, &section);
            section = heading.to_string();
            i += 1;
            continue;
        }

        if let Some(payload) = image_payload(line) {
            flush_text(&mut tokens, &mut pending, &section);
            tokens.push(Token::Image {
                base64: payload,
                section: section.clone(),
            });
            i += 1;
            continue;
        }

        if is_separator_row(line) {
            // Rows above the separator are sitting in the text buffer;
            // reclaim the trailing table-shaped lines in source order.
            let mut above: Vec<String> = Vec::new();
            while pending
                .last()
                .map(|l| is_table_row(l) && !is_separator_row(l))
                .unwrap_or(false)
            {
                if let Some(line) = pending.pop() {
                    above.push(line);
                }
            }
            above.reverse();

            flush_text(&mut tokens, &mut pending, &section);

            let mut rows: Vec<TableRow> = above.iter().filter_map(|l| parse_row(l)).collect();
            let header = !rows.is_empty();

            let mut j = i + 1;
            while j < lines.len() && is_table_row(lines[j]) {
                if !is_separator_row(lines[j]) {
                    if let Some(row) = parse_row(lines[j]) {
                        rows.push(row);
                    }
                }
                j += 1;
            }

            tokens.push(Token::Table {
                rows,
                section: section.clone(),
                header,
            });
            i = j;
            continue;
        }

        pending.push(line.to_string());
        i += 1;
    }

    flush_text(&mut tokens, &mut pending, &section);
    tokens
}

fn flush_text(tokens: &mut Vec<Token>, pending: &mut Vec<String>, section: &str) {
    if pending.is_empty() {
        return;
    }
    let content = pending.join("\n").trim().to_string();
    pending.clear();
    if !content.is_empty() {
        tokens.push(Token::Text {
            content,
            section: section.to_string(),
        });
    }
}

/// Merge runs of text tokens sharing a section into one token, joining
/// contents with newlines and trimming the result.
fn merge_adjacent_text(tokens: Vec<Token>) -> Vec<Token> {
    let mut merged: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        match (merged.last_mut(), token) {
            (
                Some(Token::Text { content, section }),
                Token::Text {
                    content: next,
                    section: next_section,
                },
            ) if *section == next_section => {
                content.push('\n');
                content.push_str(&next);
                let trimmed = content.trim().to_string();
                *content = trimmed;
            }
            (_, token) => merged.push(token),
        }
    }
    merged
}

/// Join table continuations into the preceding table token.
///
/// A continuation is a table whose separator had no rows above it:
/// converters that split a long table re-emit the separator at the top of
/// the next fragment without repeating the header.
fn merge_adjacent_tables(tokens: Vec<Token>) -> Vec<Token> {
    let mut merged: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        match (merged.last_mut(), token) {
            (
                Some(Token::Table { rows, .. }),
                Token::Table {
                    rows: more,
                    header: false,
                    ..
                },
            ) => {
                rows.extend(more);
            }
            (_, token) => merged.push(token),
        }
    }
    merged
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if let Some(stripped) = rest.strip_prefix(' ') {
            let text = stripped.trim();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn image_payload(line: &str) -> Option<String> {
    let open = line.find("](data:image/")?;
    let rest = &line[open..];
    let b64_start = rest.find(";base64,")? + ";base64,".len();
    let payload = &rest[b64_start..];
    let end = payload.find(')')?;
    let payload = &payload[..end];
    if payload.is_empty() {
        return None;
    }
    Some(payload.to_string())
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.matches('|').count() >= 2
}

fn is_separator_row(line: &str) -> bool {
    if !is_table_row(line) {
        return false;
    }
    let cells: Vec<&str> = line
        .trim()
        .split('|')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| c.contains('-') && c.chars().all(|ch| ch == '-' || ch == ':'))
}

fn parse_row(line: &str) -> Option<TableRow> {
    let cells: Vec<String> = line
        .trim()
        .split('|')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    match cells.len() {
        0 => None,
        1 => Some(TableRow {
            key: cells[0].clone(),
            value: String::new(),
        }),
        _ => Some(TableRow {
            key: cells[0].clone(),
            value: cells[1].clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, value: &str) -> TableRow {
        TableRow {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn plain_text_is_one_token() {
        let tokens = tokenize("first line\nsecond line");
        assert_eq!(
            tokens,
            vec![Token::Text {
                content: "first line\nsecond line".to_string(),
                section: String::new(),
            }]
        );
    }

    #[test]
    fn heading_sets_section_for_following_text() {
        let tokens = tokenize("intro\n## Tariffs\nbody text");
        assert_eq!(
            tokens,
            vec![
                Token::Text {
                    content: "intro".to_string(),
                    section: String::new(),
                },
                Token::Text {
                    content: "body text".to_string(),
                    section: "Tariffs".to_string(),
                },
            ]
        );
    }

    #[test]
    fn image_line_flushes_pending_text_first() {
        let md = "before\n![fig](data:image/png;base64,QUJD)\nafter";
        let tokens = tokenize(md);
        assert_eq!(tokens.len(), 3);
        assert!(matches!(&tokens[0], Token::Text { content, .. } if content == "before"));
        assert!(matches!(&tokens[1], Token::Image { base64, .. } if base64 == "QUJD"));
        assert!(matches!(&tokens[2], Token::Text { content, .. } if content == "after"));
    }

    #[test]
    fn loose_table_collects_rows_above_and_below() {
        let md = "text before\n| Card | Value |\n|---|---|\n| Series | 10 |\n| Deposit | 5000 |\ntext after";
        let tokens = tokenize(md);
        assert_eq!(tokens.len(), 3);
        match &tokens[1] {
            Token::Table { rows, header, .. } => {
                assert!(*header);
                assert_eq!(
                    rows,
                    &vec![
                        row("Card", "Value"),
                        row("Series", "10"),
                        row("Deposit", "5000"),
                    ]
                );
            }
            other => panic!("expected table, got {other:?}"),
        }
        assert!(matches!(&tokens[0], Token::Text { content, .. } if content == "text before"));
        assert!(matches!(&tokens[2], Token::Text { content, .. } if content == "text after"));
    }

    #[test]
    fn empty_cells_are_dropped() {
        let md = "| Key |  |\n|---|---|\n|  | only-value |";
        let tokens = tokenize(md);
        match &tokens[0] {
            Token::Table { rows, .. } => {
                assert_eq!(rows, &vec![row("Key", ""), row("only-value", "")]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn split_table_fragments_are_merged() {
        // The converter re-emits the separator at the top of the second
        // fragment without repeating the header row.
        let md = "| Fare | Price |\n|---|---|\n| Adult | 100 |\n\n|---|---|\n| Child | 50 |";
        let tokens = tokenize(md);
        assert_eq!(tokens.len(), 1);
        match &tokens[0] {
            Token::Table { rows, header, .. } => {
                assert!(*header);
                assert_eq!(
                    rows,
                    &vec![
                        row("Fare", "Price"),
                        row("Adult", "100"),
                        row("Child", "50"),
                    ]
                );
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn two_complete_tables_stay_separate() {
        let md = "| A | B |\n|---|---|\n| a | b |\n\n| C | D |\n|---|---|\n| c | d |";
        let tokens = tokenize(md);
        let tables: Vec<_> = tokens
            .iter()
            .filter(|t| matches!(t, Token::Table { .. }))
            .collect();
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn table_inherits_current_section() {
        let md = "## Fares\n| A | B |\n|---|---|\n| a | b |";
        let tokens = tokenize(md);
        match &tokens[0] {
            Token::Table { section, .. } => assert_eq!(section, "Fares"),
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn blank_input_yields_no_tokens() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   \n\n  ").is_empty());
    }

    #[test]
    fn tokenize_is_deterministic() {
        let md = "## S\ntext\n| A | B |\n|---|---|\n| a | b |\n![x](data:image/png;base64,Zm9v)";
        assert_eq!(tokenize(md), tokenize(md));
    }
}
