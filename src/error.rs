use thiserror::Error;

/// Helper macro for creating [`crate::Error::Malformed`] errors with source location.
///
/// ```rust, ignore
/// return Err(malformed_error!("Section {} has no raw data", index));
/// ```
macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };
    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all hard failures this library can
/// return.
///
/// Hard failures abort the current operation. Structural anomalies that a real Windows loader
/// tolerates (or rejects only at a later stage) are not reported through this type; they are
/// latched into the loader's [`crate::LoaderError`] register instead, and loading continues.
///
/// # Error Categories
///
/// ## Loading Errors
/// - [`Error::InvalidFile`] - The input is not a PE file at all
/// - [`Error::FileTooBig`] - The input exceeds the 4 GB PE size limit
/// - [`Error::NotEnoughSpace`] - Allocation of the page table or file buffer failed
///
/// ## Section Mutation Errors
/// - [`Error::EntryNotFound`] - Section or directory index out of range
/// - [`Error::NoFileAlignment`] - `FileAlignment` is zero
/// - [`Error::NoSectionAlignment`] - `SectionAlignment` is zero
///
/// ## I/O and Bounds Errors
/// - [`Error::OutOfBounds`] - Attempted to read beyond buffer boundaries
/// - [`Error::Malformed`] - A structure could not be decoded
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// # Examples
///
/// ```rust,no_run
/// use pemapper::{Error, ImageLoader};
///
/// let mut loader = ImageLoader::default();
/// match loader.load_file("sample.exe") {
///     Ok(()) => println!("Mapped {} pages", loader.page_count()),
///     Err(Error::InvalidFile) => eprintln!("Not a PE file"),
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Loading Errors
    /// The input is not a PE file.
    ///
    /// Raised when the DOS header is missing or truncated, the `MZ` signature is wrong,
    /// `e_lfanew` is unaligned or points outside the file, or the NT signature is missing.
    #[error("The file is not a valid PE image")]
    InvalidFile,
    /// The input is larger than 4 GB and cannot be a PE image.
    #[error("The file is too big to be a PE image")]
    FileTooBig,
    /// A buffer could not be allocated.
    ///
    /// Covers allocation exhaustion while building the page table or copying the input, and
    /// short reads from a stream. Also returned by section mutation when a requested split
    /// offset does not fit the section.
    #[error("Not enough space")]
    NotEnoughSpace,

    // Section Mutation Errors
    /// The requested section or data directory does not exist.
    #[error("The requested entry was not found")]
    EntryNotFound,
    /// The optional header has a zero `FileAlignment`.
    #[error("The image has no file alignment")]
    NoFileAlignment,
    /// The optional header has a zero `SectionAlignment`.
    #[error("The image has no section alignment")]
    NoSectionAlignment,

    // I/O and Bounds Errors
    /// An out of bound access was attempted.
    ///
    /// This is a safety check of the low-level readers in [`crate::file::io`]; the image
    /// accessors themselves never fail this way and return short reads instead.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,
    /// A structure is damaged and could not be decoded.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
    /// File I/O error.
    ///
    /// Wraps standard I/O errors from opening, reading, seeking or writing files.
    #[error("{0}")]
    FileError(#[from] std::io::Error),
    /// Generic error for miscellaneous failures, such as a failed memory mapping.
    #[error("{0}")]
    Error(String),
}
