use std::fmt;

use keel_snapshot::FileChange;

/// One reason a work item is out of date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeReason {
    NoHistory,
    TypeChanged { previous: String, current: String },
    PropertyChanged { name: String },
    PropertyAdded { name: String },
    PropertyRemoved { name: String },
    OutputFile(FileChange),
    InputFile(FileChange),
}

impl ChangeReason {
    /// Whether this reason comes from the input snapshot diff.
    pub fn is_input_file_change(&self) -> bool {
        matches!(self, ChangeReason::InputFile(_))
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::NoHistory => f.write_str("No history is available."),
            ChangeReason::TypeChanged { previous, current } => {
                write!(f, "Type has changed from '{previous}' to '{current}'.")
            }
            ChangeReason::PropertyChanged { name } => write!(f, "Value of input property '{name}' has changed."),
            ChangeReason::PropertyAdded { name } => write!(f, "Input property '{name}' has been added."),
            ChangeReason::PropertyRemoved { name } => write!(f, "Input property '{name}' has been removed."),
            ChangeReason::OutputFile(change) => write!(f, "Output file {change}."),
            ChangeReason::InputFile(change) => write!(f, "Input file {change}."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_snapshot::ChangeKind;
    use std::sync::Arc;

    #[test]
    fn messages_name_the_offending_path() {
        let reason = ChangeReason::InputFile(FileChange::new(Arc::from("/src/a.txt"), ChangeKind::Changed));
        assert_eq!(reason.to_string(), "Input file /src/a.txt has changed.");
        assert_eq!(
            ChangeReason::OutputFile(FileChange::new(Arc::from("/out"), ChangeKind::Removed)).to_string(),
            "Output file /out has been removed."
        );
    }
}
