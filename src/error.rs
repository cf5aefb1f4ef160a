use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    #[error("invalid matcher configuration: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error(
        "label {label} of example {example} is out of range for {num_classes} classes"
    )]
    LabelOutOfRange {
        example: usize,
        label: usize,
        num_classes: usize,
    },
    #[error("non-finite matching cost in example {example}")]
    NonFiniteCost { example: usize },
    #[error("Error: {0}")]
    LapjvError(String),
}
