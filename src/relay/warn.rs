/// Collapses a value to one whitespace-free token; empty becomes `na`.
fn sanitize_value(value: &str) -> String {
    let token = value
        .split_ascii_whitespace()
        .map(|word| word.chars().filter(char::is_ascii_graphic).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if token.is_empty() {
        "na".to_string()
    } else {
        token
    }
}

/// A grep-able `RELAY_WARN key=value ...` line.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub action: &'a str,
    pub chat: &'a str,
    pub session: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn format_line(event: &WarnEvent<'_>) -> String {
    let fields = [
        ("code", event.code),
        ("action", event.action),
        ("chat", event.chat),
        ("session", event.session),
        ("reason", event.reason),
        ("err", event.err),
    ];
    let mut line = String::from("RELAY_WARN");
    for (key, value) in fields {
        line.push_str(&format!(" {key}={}", sanitize_value(value)));
    }
    line
}

pub fn emit(event: WarnEvent<'_>) {
    tracing::warn!("{}", format_line(&event));
}
