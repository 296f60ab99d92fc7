/// Verbosity cap for the instance debug messenger. Ordered from most to
/// least chatty so `<=` comparisons read naturally.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}
