//! Splitting articles into fragments.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{ArticleMetadata, Fragment};

/// Inbound article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRequest {
    pub article_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ArticleMetadata,
}

/// Fragment id for the `order`-th piece of an article.
pub fn fragment_id(article_id: &str, order: u32) -> String {
    format!("{}_f{}", article_id, order)
}

/// Split text on blank lines, merging consecutive paragraphs while they fit
/// in `max_chars` and hard-splitting longer paragraphs on whitespace.
pub fn split_article(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs(text) {
        let len = paragraph.chars().count();
        if len > max_chars {
            flush(&mut pieces, &mut current);
            pieces.extend(hard_split(&paragraph, max_chars));
        } else if current.is_empty() {
            current = paragraph;
        } else if current.chars().count() + 2 + len <= max_chars {
            current.push_str("\n\n");
            current.push_str(&paragraph);
        } else {
            flush(&mut pieces, &mut current);
            current = paragraph;
        }
    }
    flush(&mut pieces, &mut current);
    pieces
}

/// Build the article's fragments, numbered from 0.
pub fn fragments_for(request: &ArticleRequest, max_chars: usize) -> Result<Vec<Fragment>, ValidationError> {
    if request.article_id.trim().is_empty() {
        return Err(ValidationError::EmptyField { field: "article_id" });
    }
    request.metadata.validate()?;
    let pieces = split_article(&request.text, max_chars);
    if pieces.is_empty() {
        return Err(ValidationError::EmptyField { field: "text" });
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(order, text)| {
            let order = order as u32;
            Fragment::new(fragment_id(&request.article_id, order), &request.article_id, order, text)
                .map(|f| f.with_metadata(request.metadata.clone()))
        })
        .collect()
}

fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !lines.is_empty() {
                out.push(lines.join("\n"));
                lines.clear();
            }
        } else {
            lines.push(line.trim());
        }
    }
    if !lines.is_empty() {
        out.push(lines.join("\n"));
    }
    out
}

fn flush(pieces: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        pieces.push(std::mem::take(current));
    }
}

fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in paragraph.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            flush(&mut pieces, &mut current);
            current_len = 0;
            let chars: Vec<char> = word.chars().collect();
            pieces.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let needed = if current.is_empty() { word_len } else { current_len + 1 + word_len };
        if needed > max_chars {
            flush(&mut pieces, &mut current);
            current.push_str(word);
            current_len = word_len;
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
        }
    }
    flush(&mut pieces, &mut current);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_paragraphs_are_merged() {
        let text = "Primer párrafo.\n\nSegundo párrafo.\n\n\nTercero.";
        let pieces = split_article(text, 100);
        assert_eq!(pieces, vec!["Primer párrafo.\n\nSegundo párrafo.\n\nTercero."]);
    }

    #[test]
    fn paragraphs_that_do_not_fit_start_a_new_piece() {
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc";
        let pieces = split_article(text, 20);
        assert_eq!(pieces, vec!["aaaa aaaa\n\nbbbb bbbb", "cccc"]);
    }

    #[test]
    fn long_paragraphs_are_split_on_whitespace() {
        let text = "uno dos tres cuatro cinco seis";
        let pieces = split_article(text, 10);
        assert_eq!(pieces, vec!["uno dos", "tres", "cuatro", "cinco seis"]);
        assert!(pieces.iter().all(|p| p.chars().count() <= 10));
    }

    #[test]
    fn oversized_words_are_chunked() {
        let pieces = split_article("abcdefghij", 4);
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn fragments_are_numbered_and_carry_metadata() {
        let request = ArticleRequest {
            article_id: "art-7".into(),
            text: "Uno.\n\nDos.".into(),
            metadata: ArticleMetadata::default().with_medio("El Diario"),
        };
        let fragments = fragments_for(&request, 5).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].fragment_id(), "art-7_f1");
        assert_eq!(fragments[1].source_article_id(), "art-7");
        assert_eq!(fragments[1].order_in_article(), 1);
        assert_eq!(fragments[0].metadata().medio.as_deref(), Some("El Diario"));
    }

    #[test]
    fn blank_articles_are_rejected() {
        let request = ArticleRequest {
            article_id: "a".into(),
            text: "  \n\n ".into(),
            metadata: ArticleMetadata::default(),
        };
        assert!(fragments_for(&request, 100).is_err());
    }
}
