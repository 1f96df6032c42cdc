//! Recognizing worker processes in the process table.
//!
//! A process is a worker when its command line contains one of the
//! configured markers. Its *type tag* is the file stem of the first
//! command-line token carrying a marker, so `node /opt/tools/jira-mcp.js`
//! and `/usr/bin/jira-mcp --stdio` both belong to `jira-mcp`.

#[derive(Debug, Clone)]
pub struct WorkerMatcher {
    markers: Vec<String>,
}

impl WorkerMatcher {
    pub fn new(markers: Vec<String>) -> Self {
        let markers = markers.into_iter().filter(|m| !m.is_empty()).collect();
        Self { markers }
    }

    pub fn matches(&self, command_line: &str) -> bool {
        self.markers.iter().any(|m| command_line.contains(m.as_str()))
    }

    pub fn type_tag(&self, command_line: &str) -> Option<String> {
        let token = command_line
            .split_whitespace()
            .find(|token| self.markers.iter().any(|m| token.contains(m.as_str())))?;

        let base = token.rsplit(['/', '\\']).next().unwrap_or(token);
        let stem = match base.rfind('.') {
            Some(idx) if idx > 0 => &base[..idx],
            _ => base,
        };
        if stem.is_empty() {
            None
        } else {
            Some(stem.to_string())
        }
    }
}
