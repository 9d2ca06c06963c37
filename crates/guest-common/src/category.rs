/// How the caller of a failing operation should react.
///
/// Every error enum in the guest crates maps its variants onto one of these,
/// so loops can decide between retrying, skipping and giving up without
/// matching on foreign error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Temporary condition, retry the same operation.
    Transient,
    /// Setup step failed; log it and carry on.
    Soft,
    /// The current unit of work is aborted; the next one may succeed.
    Operation,
    /// Init cannot continue.
    Process,
    /// Input could not be parsed; skip that item.
    Malformed,
}

impl Category {
    pub fn is_fatal(self) -> bool {
        matches!(self, Category::Process)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Category::Transient => "transient",
            Category::Soft => "soft",
            Category::Operation => "operation",
            Category::Process => "process",
            Category::Malformed => "malformed",
        };
        f.write_str(name)
    }
}
