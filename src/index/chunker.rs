// Paragraph-aggregation chunker

/// Split text into chunks by accumulating blank-line-separated paragraphs.
///
/// Paragraphs are packed into a running chunk until adding the next one
/// would exceed `max_chars`; the chunk is then closed and the paragraph
/// starts the next one. A single paragraph longer than `max_chars` becomes
/// its own oversized chunk rather than being split mid-paragraph.
pub fn chunk_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        if !current.is_empty() && current.len() + paragraph.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_paragraphs("first paragraph\n\nsecond paragraph", 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "first paragraph\n\nsecond paragraph");
    }

    #[test]
    fn test_chunks_close_at_max_length() {
        let a = "a".repeat(600);
        let b = "b".repeat(600);
        let c = "c".repeat(100);
        let text = format!("{a}\n\n{b}\n\n{c}");
        let chunks = chunk_paragraphs(&text, 1000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], a);
        assert_eq!(chunks[1], format!("{b}\n\n{c}"));
    }

    #[test]
    fn test_oversized_paragraph_kept_whole() {
        let big = "x".repeat(3000);
        let chunks = chunk_paragraphs(&big, 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3000);
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_paragraphs("", 1000).is_empty());
    }

    #[test]
    fn test_paragraph_order_preserved() {
        let text = "one\n\ntwo\n\nthree";
        let chunks = chunk_paragraphs(text, 4);
        assert_eq!(chunks, vec!["one", "two", "three"]);
    }
}
