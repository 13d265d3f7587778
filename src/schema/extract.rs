//! Locate the JSON payload inside a chatty model response.

/// Extract the first JSON object from text that may carry prose or markdown fences.
///
/// Fenced blocks are preferred; otherwise the first balanced `{...}` span is
/// returned. Braces inside JSON strings do not affect balancing.
pub fn extract_payload(text: &str) -> Option<&str> {
    let text = text.trim();
    let scope = fenced_block(text).unwrap_or(text);
    balanced_object(scope).or_else(|| {
        // A fence holding prose should not hide a payload elsewhere in the reply.
        if scope.len() != text.len() {
            balanced_object(text)
        } else {
            None
        }
    })
}

fn fenced_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return Some(text[start..start + end].trim());
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return Some(text[start..start + end].trim());
        }
    }

    None
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede a closing `}` or `]` outside strings.
pub fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        if ch == ',' {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}
