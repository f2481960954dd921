/// Maps a standard entry-point name onto the vendor's exported symbol.
pub fn vendor_symbol_name(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

/// Lookups worth a log line: instance creation and the dispatch bootstrap.
pub fn is_traced_name(name: &str) -> bool {
    ["CreateInstance", "ProcAddr", "EnumerateInstance", "EnumeratePhysical"]
        .iter()
        .any(|needle| name.contains(needle))
}
