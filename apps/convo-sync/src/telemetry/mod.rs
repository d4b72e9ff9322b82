pub mod logging;

/// `Some(true)` for any non-empty value other than `0`.
fn flag(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|value| !value.is_empty() && value != "0")
}
