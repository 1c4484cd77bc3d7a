/// Whether a cell's value can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReactiveNodeState {
    /// The value reflects the current values of all its inputs.
    #[default]
    Clean,
    /// An input has changed since the value was produced.
    Dirty,
}
