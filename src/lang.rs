use anyhow::Result;
use std::collections::HashMap;

// Message keys
pub const OUTDATED_CLIENT: &str = "OUTDATED_CLIENT";
pub const OUTDATED_SERVER: &str = "OUTDATED_SERVER";
pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
pub const AUTH_FAILED: &str = "AUTH_FAILED";
pub const BACKEND_UNREACHABLE: &str = "BACKEND_UNREACHABLE";
pub const AUTH_TYPE_MISMATCH: &str = "AUTH_TYPE_MISMATCH";
pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
pub const PACK_REFUSED: &str = "PACK_REFUSED";
pub const CLIENT_QUIT: &str = "CLIENT_QUIT";
pub const KICKED: &str = "KICKED";
pub const INTERNAL: &str = "INTERNAL";
pub const SERVER_FULL: &str = "SERVER_FULL";
pub const LOGIN_NOTICE_TITLE: &str = "LOGIN_NOTICE_TITLE";
pub const LOGIN_NOTICE_BODY: &str = "LOGIN_NOTICE_BODY";
pub const LOGIN_BUTTON: &str = "LOGIN_BUTTON";
pub const DISCONNECT_BUTTON: &str = "DISCONNECT_BUTTON";
pub const DEVICE_CODE_TITLE: &str = "DEVICE_CODE_TITLE";
pub const DEVICE_CODE_BODY: &str = "DEVICE_CODE_BODY";
pub const TOKEN_EXPIRED_TITLE: &str = "TOKEN_EXPIRED_TITLE";
pub const TOKEN_EXPIRED_BODY: &str = "TOKEN_EXPIRED_BODY";
pub const WAIT_LOGIN: &str = "WAIT_LOGIN";
pub const LOGIN_SUCCESS: &str = "LOGIN_SUCCESS";

const DEFAULTS: &[(&str, &str)] = &[
    (OUTDATED_CLIENT, "Outdated client! Please use {0}"),
    (OUTDATED_SERVER, "Outdated proxy! It still supports {0}"),
    (SHUTTING_DOWN, "The proxy is shutting down"),
    (AUTH_FAILED, "Failed to authenticate: {0}"),
    (BACKEND_UNREACHABLE, "Could not reach the remote server: {0}"),
    (AUTH_TYPE_MISMATCH, "The remote server requires an online account login"),
    (PROTOCOL_VIOLATION, "Protocol error: {0}"),
    (PACK_REFUSED, "You must accept the resource packs to join this server"),
    (CLIENT_QUIT, "Disconnected"),
    (KICKED, "{0}"),
    (INTERNAL, "Internal proxy error"),
    (SERVER_FULL, "The proxy is full"),
    (LOGIN_NOTICE_TITLE, "Account required"),
    (LOGIN_NOTICE_BODY, "This server needs a Java Edition account. Log in to continue."),
    (LOGIN_BUTTON, "Log in"),
    (DISCONNECT_BUTTON, "Disconnect"),
    (DEVICE_CODE_TITLE, "Log in"),
    (DEVICE_CODE_BODY, "Go to {0} and enter the code {1}"),
    (TOKEN_EXPIRED_TITLE, "Session expired"),
    (TOKEN_EXPIRED_BODY, "Your saved login has expired. Log in again to continue."),
    (WAIT_LOGIN, "Please wait while you are logged in..."),
    (LOGIN_SUCCESS, "Logged in as {0}"),
];

/// Localised UI and disconnect texts, keyed by the constants above.
#[derive(Debug, Clone)]
pub struct Messages(HashMap<&'static str, String>);

impl Default for Messages {
    fn default() -> Self {
        Self(DEFAULTS.iter().map(|(k, v)| (*k, v.to_string())).collect())
    }
}

impl Messages {
    pub fn get<'a>(&'a self, key: &'a str) -> &'a str {
        self.0.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Look up `key` and substitute `{0}`, `{1}`, ... positionally.
    /// Arguments are inserted verbatim, never rescanned for placeholders.
    pub fn format(&self, key: &str, args: &[&str]) -> String {
        let template = self.get(key);
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let arg = after
                .find('}')
                .and_then(|close| after[..close].parse::<usize>().ok().map(|i| (i, close)))
                .and_then(|(i, close)| args.get(i).map(|a| (a, close)));
            match arg {
                Some((a, close)) => {
                    out.push_str(a);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Parses a `key: value` lang file over the built-in defaults.
/// Lines starting with `//` are comments. Unknown keys are silently ignored.
pub fn parse_lang_file(content: &str) -> Result<Messages> {
    let mut msgs = Messages::default();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("//") || line.is_empty() {
            continue;
        }
        if let Some((key, val)) = line.split_once(':') {
            let key = key.trim().to_ascii_uppercase();
            if let Some((known, _)) = DEFAULTS.iter().find(|(k, _)| *k == key) {
                msgs.0.insert(known, val.trim().to_string());
            }
        }
    }
    Ok(msgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
// Proxy lang file
OUTDATED_CLIENT: Please update to {0}
shutting_down: Back soon
NOT_A_KEY: ignored
"#;

    #[test]
    fn test_parse_lang_file_overrides() {
        let msgs = parse_lang_file(FIXTURE).unwrap();
        assert_eq!(msgs.get(OUTDATED_CLIENT), "Please update to {0}");
        assert_eq!(msgs.get(SHUTTING_DOWN), "Back soon");
        // untouched keys keep the built-in text
        assert_eq!(msgs.get(PACK_REFUSED), "You must accept the resource packs to join this server");
    }

    #[test]
    fn test_parse_lang_file_ignores_comments() {
        let msgs = parse_lang_file("// KICKED: nope\n").unwrap();
        assert_eq!(msgs.get(KICKED), "{0}");
    }

    #[test]
    fn test_format_placeholders() {
        let msgs = Messages::default();
        assert_eq!(
            msgs.format(DEVICE_CODE_BODY, &["https://example.test/link", "ABCD"]),
            "Go to https://example.test/link and enter the code ABCD"
        );
        assert_eq!(msgs.format(OUTDATED_SERVER, &["1.20.10/1.20.12"]), "Outdated proxy! It still supports 1.20.10/1.20.12");
    }

    #[test]
    fn test_format_does_not_rescan_arguments() {
        let msgs = Messages::default();
        assert_eq!(
            msgs.format(DEVICE_CODE_BODY, &["{1}", "ABCD"]),
            "Go to {1} and enter the code ABCD"
        );
        // missing arguments leave the placeholder in place
        assert_eq!(msgs.format(DEVICE_CODE_BODY, &["x"]), "Go to x and enter the code {1}");
    }

    #[test]
    fn test_unknown_key_falls_back_to_key() {
        let msgs = Messages::default();
        assert_eq!(msgs.get("MISSING"), "MISSING");
    }
}
