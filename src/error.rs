//! Platform-independent status codes and the library error type
//!
//! Every fallible operation in the crate reports failure through [`Error`],
//! which pairs a [`StatusCode`] with an optional human-readable detail. OS
//! errors are normalized through their `errno` value so callers never see
//! platform-specific numbers.
//!
//! Asynchronous operations deliver their outcome to a completion callback as
//! `Result<(), Error>`; `Ok` is the success status.

use std::fmt;
use std::io;

/// Closed set of failure statuses reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum StatusCode {
    #[error("undefined error")]
    Undefined,

    // Argument and validation errors
    #[error("invalid argument")]
    InvalidArgument,
    #[error("message too long")]
    MessageTooLong,
    #[error("destination address required")]
    DestinationAddressRequired,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("name too long")]
    NameTooLong,
    #[error("bad address in system call argument")]
    BadAddressInSystemCallArgument,

    // Resource errors
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("file table overflow")]
    FileTableOverflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no buffer space available")]
    NoBufferSpaceAvailable,
    #[error("address already in use")]
    AddressAlreadyInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("resource temporarily unavailable")]
    ResourceTemporarilyUnavailable,
    #[error("resource busy or locked")]
    ResourceBusyOrLocked,
    #[error("no space left on device")]
    NoSpaceLeftOnDevice,

    // Connection state errors
    #[error("socket is not connected")]
    SocketIsNotConnected,
    #[error("socket is already connected")]
    SocketIsAlreadyConnected,
    #[error("connection already in progress")]
    ConnectionAlreadyInProgress,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("software caused connection abort")]
    SoftwareCausedConnectionAbort,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("cannot send after transport endpoint shutdown")]
    CannotSendAfterTransportEndpointShutdown,
    #[error("host is unreachable")]
    HostIsUnreachable,
    #[error("network is down")]
    NetworkIsDown,
    #[error("network is unreachable")]
    NetworkIsUnreachable,
    #[error("protocol error")]
    ProtocolError,
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("operation not supported on socket")]
    OperationNotSupportedOnSocket,
    #[error("socket operation on non-socket")]
    SocketOperationOnNonSocket,

    // Filesystem errors
    #[error("no such file or directory")]
    NoSuchFileOrDirectory,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("file or directory already exists")]
    FileOrDirAlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("illegal operation on a directory")]
    IllegalOperationOnADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("too many symbolic links encountered")]
    TooManySymbolicLinksEncountered,
    #[error("read-only file system")]
    ReadOnlyFileSystem,
    #[error("file too large")]
    FileTooLarge,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file is not open")]
    FileNotOpen,
    #[error("end of file")]
    EndOfFile,
    #[error("i/o error")]
    IoError,

    // Miscellaneous
    #[error("interrupted system call")]
    InterruptedSystemCall,
    #[error("function not implemented")]
    FunctionNotImplemented,
    #[error("tls error")]
    TlsError,
    #[error("unknown error")]
    UnknownError,
}

impl StatusCode {
    /// Maps an OS `errno` value to a status code
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM => StatusCode::OperationNotPermitted,
            libc::ENOENT => StatusCode::NoSuchFileOrDirectory,
            libc::EINTR => StatusCode::InterruptedSystemCall,
            libc::EIO => StatusCode::IoError,
            libc::E2BIG => StatusCode::ArgumentListTooLong,
            libc::EBADF => StatusCode::BadFileDescriptor,
            libc::EAGAIN => StatusCode::ResourceTemporarilyUnavailable,
            libc::ENOMEM => StatusCode::OutOfMemory,
            libc::EACCES => StatusCode::PermissionDenied,
            libc::EFAULT => StatusCode::BadAddressInSystemCallArgument,
            libc::EBUSY => StatusCode::ResourceBusyOrLocked,
            libc::EEXIST => StatusCode::FileOrDirAlreadyExists,
            libc::ENOTDIR => StatusCode::NotADirectory,
            libc::EISDIR => StatusCode::IllegalOperationOnADirectory,
            libc::EINVAL => StatusCode::InvalidArgument,
            libc::ENFILE => StatusCode::FileTableOverflow,
            libc::EMFILE => StatusCode::TooManyOpenFiles,
            libc::EFBIG => StatusCode::FileTooLarge,
            libc::ENOSPC => StatusCode::NoSpaceLeftOnDevice,
            libc::EROFS => StatusCode::ReadOnlyFileSystem,
            libc::EPIPE => StatusCode::BrokenPipe,
            libc::ENAMETOOLONG => StatusCode::NameTooLong,
            libc::ENOSYS => StatusCode::FunctionNotImplemented,
            libc::ENOTEMPTY => StatusCode::DirectoryNotEmpty,
            libc::ELOOP => StatusCode::TooManySymbolicLinksEncountered,
            libc::ENOTSOCK => StatusCode::SocketOperationOnNonSocket,
            libc::EDESTADDRREQ => StatusCode::DestinationAddressRequired,
            libc::EMSGSIZE => StatusCode::MessageTooLong,
            libc::EPROTONOSUPPORT => StatusCode::ProtocolNotSupported,
            libc::EOPNOTSUPP => StatusCode::OperationNotSupportedOnSocket,
            libc::EAFNOSUPPORT => StatusCode::AddressFamilyNotSupported,
            libc::EADDRINUSE => StatusCode::AddressAlreadyInUse,
            libc::EADDRNOTAVAIL => StatusCode::AddressNotAvailable,
            libc::ENETDOWN => StatusCode::NetworkIsDown,
            libc::ENETUNREACH => StatusCode::NetworkIsUnreachable,
            libc::ECONNABORTED => StatusCode::SoftwareCausedConnectionAbort,
            libc::ECONNRESET => StatusCode::ConnectionResetByPeer,
            libc::ENOBUFS => StatusCode::NoBufferSpaceAvailable,
            libc::EISCONN => StatusCode::SocketIsAlreadyConnected,
            libc::ENOTCONN => StatusCode::SocketIsNotConnected,
            libc::ESHUTDOWN => StatusCode::CannotSendAfterTransportEndpointShutdown,
            libc::ETIMEDOUT => StatusCode::ConnectionTimedOut,
            libc::ECONNREFUSED => StatusCode::ConnectionRefused,
            libc::EHOSTUNREACH => StatusCode::HostIsUnreachable,
            libc::EALREADY => StatusCode::ConnectionAlreadyInProgress,
            libc::EPROTO => StatusCode::ProtocolError,
            libc::ECANCELED => StatusCode::OperationCanceled,
            _ => StatusCode::UnknownError,
        }
    }

    fn from_io_kind(kind: io::ErrorKind) -> Self {
        use io::ErrorKind as K;
        match kind {
            K::NotFound => StatusCode::NoSuchFileOrDirectory,
            K::PermissionDenied => StatusCode::PermissionDenied,
            K::ConnectionRefused => StatusCode::ConnectionRefused,
            K::ConnectionReset => StatusCode::ConnectionResetByPeer,
            K::ConnectionAborted => StatusCode::SoftwareCausedConnectionAbort,
            K::NotConnected => StatusCode::SocketIsNotConnected,
            K::AddrInUse => StatusCode::AddressAlreadyInUse,
            K::AddrNotAvailable => StatusCode::AddressNotAvailable,
            K::BrokenPipe => StatusCode::BrokenPipe,
            K::AlreadyExists => StatusCode::FileOrDirAlreadyExists,
            K::WouldBlock => StatusCode::ResourceTemporarilyUnavailable,
            K::InvalidInput | K::InvalidData => StatusCode::InvalidArgument,
            K::TimedOut => StatusCode::ConnectionTimedOut,
            K::Interrupted => StatusCode::InterruptedSystemCall,
            K::Unsupported => StatusCode::FunctionNotImplemented,
            K::UnexpectedEof => StatusCode::EndOfFile,
            K::OutOfMemory => StatusCode::OutOfMemory,
            _ => StatusCode::UnknownError,
        }
    }
}

/// Failure status plus an optional detail message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: StatusCode,
    message: Option<String>,
}

/// Convenience alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new(code: StatusCode) -> Self {
        Self { code, message: None }
    }

    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: Some(message.into()) }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Shorthand for the status most teardown paths report
    pub(crate) fn canceled() -> Self {
        Self::new(StatusCode::OperationCanceled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.code)
    }
}

impl From<StatusCode> for Error {
    fn from(code: StatusCode) -> Self {
        Error::new(code)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let code = match e.raw_os_error() {
            Some(errno) => StatusCode::from_errno(errno),
            None => StatusCode::from_io_kind(e.kind()),
        };
        Error::new(code)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::with_message(StatusCode::TlsError, e.to_string())
    }
}

impl From<openssl::ssl::Error> for Error {
    fn from(e: openssl::ssl::Error) -> Self {
        match e.io_error() {
            Some(io) if io.kind() != io::ErrorKind::WouldBlock => {
                Error::new(match io.raw_os_error() {
                    Some(errno) => StatusCode::from_errno(errno),
                    None => StatusCode::from_io_kind(io.kind()),
                })
            }
            _ => Error::with_message(StatusCode::TlsError, e.to_string()),
        }
    }
}
