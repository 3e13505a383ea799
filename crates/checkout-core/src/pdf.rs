//! # PDF Writer
//!
//! Minimal, deterministic PDF 1.4 output: Helvetica text and straight
//! lines on US Letter pages. No compression, timestamps or document ids,
//! so identical input always produces identical bytes.

use std::fmt::Write as _;

/// US Letter width in points
pub const PAGE_WIDTH: i32 = 612;
/// US Letter height in points
pub const PAGE_HEIGHT: i32 = 792;

/// Builds a PDF page by page
#[derive(Debug, Default)]
pub struct PdfWriter {
    pages: Vec<String>,
    current: String,
}

impl PdfWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a single line of text with its baseline at `(x, y)`
    pub fn text(&mut self, x: i32, y: i32, size: u32, text: &str) {
        let _ = writeln!(
            self.current,
            "BT /F1 {} Tf {} {} Td ({}) Tj ET",
            size,
            x,
            y,
            escape_text(text)
        );
    }

    /// Draw a straight line
    pub fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        let _ = writeln!(self.current, "1 w {} {} m {} {} l S", x1, y1, x2, y2);
    }

    /// Close the current page and start a new one
    pub fn new_page(&mut self) {
        let page = std::mem::take(&mut self.current);
        self.pages.push(page);
    }

    /// Pages written so far, including the open one
    pub fn page_count(&self) -> usize {
        self.pages.len() + 1
    }

    /// Serialize the document
    pub fn finish(mut self) -> Vec<u8> {
        self.new_page();
        let pages = self.pages;

        let mut out = Vec::new();
        let mut offsets = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

        // 1 catalog, 2 page tree, 3 font, then (page, contents) pairs.
        let kids: Vec<String> = (0..pages.len())
            .map(|i| format!("{} 0 R", 4 + 2 * i))
            .collect();

        push_object(&mut out, &mut offsets, "<< /Type /Catalog /Pages 2 0 R >>");
        push_object(
            &mut out,
            &mut offsets,
            &format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()),
        );
        push_object(
            &mut out,
            &mut offsets,
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
        );

        for (i, content) in pages.iter().enumerate() {
            let contents_ref = 5 + 2 * i;
            push_object(
                &mut out,
                &mut offsets,
                &format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                     /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                    PAGE_WIDTH, PAGE_HEIGHT, contents_ref
                ),
            );
            let stream = content.trim_end();
            push_object(
                &mut out,
                &mut offsets,
                &format!("<< /Length {} >>\nstream\n{}\nendstream", stream.len(), stream),
            );
        }

        let xref_offset = out.len();
        let mut tail = String::new();
        let _ = write!(tail, "xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1);
        for offset in &offsets {
            let _ = write!(tail, "{:010} 00000 n \n", offset);
        }
        let _ = write!(
            tail,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            offsets.len() + 1,
            xref_offset
        );
        out.extend_from_slice(tail.as_bytes());
        out
    }
}

fn push_object(out: &mut Vec<u8>, offsets: &mut Vec<usize>, body: &str) {
    offsets.push(out.len());
    let object = format!("{} 0 obj\n{}\nendobj\n", offsets.len(), body);
    out.extend_from_slice(object.as_bytes());
}

/// Escape a string literal. Anything outside printable ASCII becomes `?`.
fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '(' | ')' => {
                escaped.push('\\');
                escaped.push(c);
            }
            ' '..='~' => escaped.push(c),
            _ => escaped.push('?'),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn test_single_page_document() {
        let mut pdf = PdfWriter::new();
        pdf.text(72, 700, 12, "Hello");
        pdf.line(72, 690, 300, 690);

        let text = as_text(&pdf.finish());
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("(Hello) Tj"));
        assert!(text.contains("72 690 m 300 690 l S"));
        assert!(text.contains("/Count 1"));
        assert!(text.ends_with("%%EOF\n"));
    }

    #[test]
    fn test_text_escaping() {
        assert_eq!(escape_text("a (b) \\ c"), "a \\(b\\) \\\\ c");
        assert_eq!(escape_text("café"), "caf?");
    }

    #[test]
    fn test_xref_offsets_point_at_objects() {
        let mut pdf = PdfWriter::new();
        pdf.text(72, 700, 12, "one");
        pdf.new_page();
        pdf.text(72, 700, 12, "two");
        let bytes = pdf.finish();
        let text = as_text(&bytes);

        assert!(text.contains("/Kids [4 0 R 6 0 R] /Count 2"));

        let xref_at: usize = text
            .rsplit("startxref\n")
            .next()
            .and_then(|rest| rest.lines().next())
            .unwrap()
            .parse()
            .unwrap();
        let xref = std::str::from_utf8(&bytes[xref_at..]).unwrap();
        assert!(xref.starts_with("xref\n0 8\n"));

        let entries: Vec<usize> = xref
            .lines()
            .skip(3)
            .take(7)
            .map(|l| l[..10].parse().unwrap())
            .collect();
        for (i, offset) in entries.iter().enumerate() {
            assert!(bytes[*offset..].starts_with(format!("{} 0 obj", i + 1).as_bytes()));
        }
    }

    #[test]
    fn test_output_is_deterministic() {
        let render = || {
            let mut pdf = PdfWriter::new();
            pdf.text(72, 700, 26, "Invoice");
            pdf.finish()
        };
        assert_eq!(render(), render());
    }
}
