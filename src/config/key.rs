use crate::config::expand_tilde;
use crate::config::parse::ConfigError;
use crate::config::types::DestinationConfig;
use regex::Regex;

const PEM_LINE_WIDTH: usize = 64;

/// Normalize a PEM private key given as a file body or a single env line.
///
/// Literal `\n` escapes become newlines, anything outside the BEGIN/END
/// markers is dropped, `Proc-Type`/`DEK-Info` headers are kept, and the
/// base64 body is re-wrapped at 64 columns.
pub fn parse_key(input: &str) -> Result<String, ConfigError> {
    let normalized = input.replace("\\n", "\n");
    let normalized = normalized.trim();

    let begin_re = Regex::new(r"-----BEGIN [A-Z ]+-----").unwrap();
    let end_re = Regex::new(r"-----END [A-Z ]+-----").unwrap();
    let (Some(begin), Some(end)) = (begin_re.find(normalized), end_re.find(normalized)) else {
        return Err(ConfigError::Key(
            "PEM BEGIN/END markers not found in private key".to_string(),
        ));
    };
    if end.start() < begin.end() {
        return Err(ConfigError::Key(
            "PEM END marker precedes BEGIN marker".to_string(),
        ));
    }

    let mut block = normalized[begin.end()..end.start()].to_string();

    let mut headers = Vec::new();
    for pattern in [r"Proc-Type: [^\n]+", r"DEK-Info: [^\n]+"] {
        let re = Regex::new(pattern).unwrap();
        if let Some(m) = re.find(&block) {
            let header = m.as_str().trim().to_string();
            block = block.replacen(m.as_str(), "", 1);
            headers.push(header);
        }
    }

    let body: String = block.chars().filter(|c| !c.is_whitespace()).collect();
    if body.is_empty() {
        return Err(ConfigError::Key("PEM body is empty".to_string()));
    }

    let mut lines = vec![begin.as_str().to_string()];
    if !headers.is_empty() {
        lines.extend(headers);
        // RFC 1421: a blank line separates the encryption headers from the body.
        lines.push(String::new());
    }
    lines.extend(
        body.as_bytes()
            .chunks(PEM_LINE_WIDTH)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned()),
    );
    lines.push(end.as_str().to_string());

    Ok(lines.join("\n"))
}

/// Read the signing key configured for `destination`, preferring the key file.
pub fn load_private_key(destination: &DestinationConfig) -> Result<String, ConfigError> {
    if let Some(path) = &destination.key_file {
        let path = expand_tilde(path);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            ConfigError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read key file '{}': {}", path.display(), e),
            ))
        })?;
        return parse_key(&raw);
    }

    match destination.key_content.as_deref() {
        Some(content) if !content.trim().is_empty() => parse_key(content),
        _ => Err(ConfigError::Key(
            "set either OCI_KEY_FILE or OCI_KEY_CONTENT".to_string(),
        )),
    }
}

/// Shorten a secret for logging: the first `keep` characters, then `...***`.
pub fn mask(value: &str, keep: usize) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= keep {
        return "***".to_string();
    }
    let prefix: String = value.chars().take(keep).collect();
    format!("{prefix}...***")
}
