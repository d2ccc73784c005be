//! Character-bounded content chunking.

/// Split episode content into chunks of at most `max_characters`
/// characters, preferring paragraph boundaries, then sentence
/// boundaries, then hard splits. Empty content yields no chunks.
pub fn split_text(content: &str, max_characters: usize) -> Vec<String> {
    let content = content.trim();
    if content.is_empty() {
        return Vec::new();
    }
    let max_characters = max_characters.max(1);
    if content.chars().count() <= max_characters {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        for piece in split_paragraph(paragraph, max_characters) {
            let current_len = current.chars().count();
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + piece_len + 1 > max_characters {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_paragraph(paragraph: &str, max_characters: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_characters {
        return vec![paragraph.to_string()];
    }
    let mut pieces = Vec::new();
    for sentence in split_sentences(paragraph) {
        if sentence.chars().count() <= max_characters {
            pieces.push(sentence);
        } else {
            pieces.extend(hard_split(&sentence, max_characters));
        }
    }
    pieces
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |next| next.is_whitespace()) {
            sentences.push(current.trim().to_string());
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn hard_split(text: &str, max_characters: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_characters)
        .map(|window| window.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}
