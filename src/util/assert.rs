/// Logs and panics with an internal-assertion message carrying a stable hex identifier.
///
/// Used for broken internal invariants only; recoverable conditions return errors instead.
pub fn fail(id: u32, message: impl AsRef<str>) -> ! {
    let formatted = assertion_error(id, message);
    log::error!(target: "firestore::assert", "{formatted}");
    panic!("{formatted}");
}

/// Calls [`fail`] when `condition` is false.
pub fn hard_assert(condition: bool, id: u32, message: impl AsRef<str>) {
    if !condition {
        fail(id, message);
    }
}

/// Build the string used when raising assertion failures.
pub fn assertion_error(id: u32, message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({}) INTERNAL ASSERTION FAILED: {} (ID: {:#06x})",
        env!("CARGO_PKG_VERSION"),
        message.as_ref(),
        id
    )
}
