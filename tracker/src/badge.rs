//! Flat SVG badges for embedding repository totals in READMEs.

const CHAR_WIDTH: usize = 7;
const PADDING: usize = 10;

/// Formats `n` with comma thousands separators.
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Badge showing a repository's all-time clone count.
pub fn total_clones(count: u64) -> String {
    render("clones", &thousands(count), "blue")
}

pub fn render(label: &str, message: &str, color: &str) -> String {
    let label_width = label.chars().count() * CHAR_WIDTH + PADDING;
    let message_width = message.chars().count() * CHAR_WIDTH + PADDING;
    let total_width = label_width + message_width;
    let label_x = label_width as f64 / 2.0;
    let message_x = label_width as f64 + message_width as f64 / 2.0;

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total_width}" height="20">
  <linearGradient id="b" x2="0" y2="100%">
    <stop offset="0" stop-color="#bbb" stop-opacity=".1"/>
    <stop offset="1" stop-opacity=".1"/>
  </linearGradient>
  <mask id="a">
    <rect width="{total_width}" height="20" rx="3" fill="#fff"/>
  </mask>
  <g mask="url(#a)">
    <rect width="{label_width}" height="20" fill="#555"/>
    <rect x="{label_width}" width="{message_width}" height="20" fill="{color}"/>
    <rect width="{total_width}" height="20" fill="url(#b)"/>
  </g>
  <g fill="#fff" text-anchor="middle"
     font-family="DejaVu Sans,Verdana,Geneva,sans-serif" font-size="11">
    <text x="{label_x}" y="15" fill="#010101" fill-opacity=".3">{label}</text>
    <text x="{label_x}" y="14">{label}</text>
    <text x="{message_x}" y="15" fill="#010101" fill-opacity=".3">{message}</text>
    <text x="{message_x}" y="14">{message}</text>
  </g>
</svg>
"##
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thousands() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(1234), "1,234");
        assert_eq!(thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_widths_follow_text() {
        let svg = total_clones(1234);
        // "clones" is 52 wide, "1,234" is 45 wide
        assert!(svg.starts_with(r#"<svg xmlns="http://www.w3.org/2000/svg" width="97""#));
        assert!(svg.contains(r#"<rect x="52" width="45" height="20" fill="blue"/>"#));
        assert!(svg.contains(r#"<text x="26" y="14">clones</text>"#));
        assert!(svg.contains(r#"<text x="74.5" y="14">1,234</text>"#));
    }
}
