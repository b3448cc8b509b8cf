use std::error::Error;
use std::fmt::{Display, Formatter};

pub type AmidrResult<T> = Result<T, AmidrError>;
pub type ConfigResult<T> = AmidrResult<T>;
pub type SegmentResult<T> = AmidrResult<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmidrErrorCategory {
    ConfigurationError,
    SegmentationError,
    IoSystemError,
    ComputationError,
}

impl AmidrErrorCategory {
    /// Process exit status; a clean run exits with 0.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::ConfigurationError => 2,
            Self::SegmentationError => 3,
            Self::IoSystemError => 4,
            Self::ComputationError => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::SegmentationError => "SegmentationError",
            Self::IoSystemError => "IoSystemError",
            Self::ComputationError => "ComputationError",
        }
    }

    /// Configuration and segmentation failures abort the run for the dataset.
    pub const fn aborts_dataset(self) -> bool {
        matches!(self, Self::ConfigurationError | Self::SegmentationError)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmidrError {
    category: AmidrErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl AmidrError {
    fn new(
        category: AmidrErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn configuration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(AmidrErrorCategory::ConfigurationError, placeholder, message)
    }

    pub fn segmentation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(AmidrErrorCategory::SegmentationError, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(AmidrErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn computation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(AmidrErrorCategory::ComputationError, placeholder, message)
    }

    pub const fn category(&self) -> AmidrErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}

impl Display for AmidrError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for AmidrError {}
