/// Collapse every whitespace run (spaces, tabs, newlines) into one space and trim.
pub fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
