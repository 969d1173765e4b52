// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module for error handling code.

use std::fmt::{Display, Formatter};
#[cfg(feature = "backtrace")]
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;

use thiserror::Error;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`,
/// which shows up in a few signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of errors for [Error]. Use [ErrorKind::error] and [ErrorKind::error_from] to generate the
/// [Error] value for this ErrorKind.
#[derive(Debug)]
pub enum ErrorKind
{
    /// The transport layer never got a reply within `response_timeout`.
    NoResponse,

    /// The received frame failed length or CRC-16/MODBUS validation.
    Crc,

    /// A half-duplex line with echo handling enabled saw bytes that don't match what was sent.
    LocalEcho,

    /// The slave returned Modbus exception 01/02/03 (illegal function/address/value).
    IllegalRequest,

    /// The slave returned Modbus exception 04, or reported some other device-side failure.
    SlaveReported(/** exception code **/ u8),

    /// All allowed UART settings were tried and none of them got a response.
    UartSettingsNotFound,

    /// The device answered, but not in a way consistent with being a Wiren Board device.
    ForeignDevice,

    /// The device is a legacy Wiren Board device with no bootloader / fw_signature register.
    TooOldDevice,

    /// Specified firmware file seems invalid.
    IncorrectFirmware(/** why **/ String),

    /// An INFO-block write during flashing got an illegal-request response.
    NotInBootloader,

    /// A bootloader command (reset-uart/reset-eeprom) failed with a non-illegal-request error.
    BootloaderCmd,

    /// The DATA phase failed outright (two consecutive chunk failures, bootloader still alive).
    DataPhaseFailed(/** detail **/ String),

    /// Reading from, or parsing, the remote release/download store failed.
    RemoteStorage(/** what **/ String),

    /// The release manifest has no released firmware for the requested signature/suite.
    NoReleasedFirmware,

    /// A version string failed to parse.
    VersionParse(/** raw string **/ String),

    /// The user declined an interactive confirmation prompt.
    UserCancelled,

    /// The update could not proceed for device-state reasons (e.g. forbidden bootloader downgrade).
    UpdateDevice(/** why **/ String),

    /// The driver config file failed to parse.
    ConfigParsing(/** why **/ String),

    /// Unhandled external error.
    External(ErrorSource),
}

impl ErrorKind
{
    /// Creates a new [Error] from this error kind.
    ///
    /// Enables convenient code like:
    /// ```
    /// return Err(ErrorKind::NotInBootloader.error());
    /// ```
    #[inline(always)]
    pub fn error(self) -> Error
    {
        Error::new(self, None)
    }

    /// Creates a new [Error] from this error kind, with the passed error as the source.
    #[inline(always)]
    pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
    {
        Error::new(self, Some(Box::new(source)))
    }
}

/// Constructs an [Error] for this [ErrorKind].
impl From<ErrorKind> for Error
{
    /// Constructs an [Error] for this [ErrorKind].
    fn from(other: ErrorKind) -> Self
    {
        other.error()
    }
}

impl Display for ErrorKind
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        use ErrorKind::*;
        match self {
            NoResponse => write!(f, "no response from device within the configured timeout")?,
            Crc => write!(f, "received frame failed CRC-16/MODBUS validation")?,
            LocalEcho => write!(f, "half-duplex echo did not match the request that was sent")?,
            IllegalRequest => write!(f, "device reported an illegal request (modbus exception 01/02/03)")?,
            SlaveReported(code) => write!(f, "device reported a failure (modbus exception {:02x})", code)?,
            UartSettingsNotFound => write!(f, "no allowed UART setting got a response from the device")?,
            ForeignDevice => write!(f, "device does not appear to be a Wiren Board device")?,
            TooOldDevice => write!(f, "device is too old to support in-field firmware update")?,
            IncorrectFirmware(why) => write!(f, "firmware file is invalid: {}", why)?,
            NotInBootloader => write!(f, "device is not in bootloader mode")?,
            BootloaderCmd => write!(f, "bootloader command failed")?,
            DataPhaseFailed(detail) => write!(f, "flashing failed: {}", detail)?,
            RemoteStorage(what) => write!(f, "remote firmware storage error: {}", what)?,
            NoReleasedFirmware => write!(f, "no released firmware found for this device/suite")?,
            VersionParse(raw) => write!(f, "could not parse version string {:?}", raw)?,
            UserCancelled => write!(f, "operation cancelled by user")?,
            UpdateDevice(why) => write!(f, "update refused: {}", why)?,
            ConfigParsing(why) => write!(f, "failed to parse configuration: {}", why)?,
            External(source) => {
                use ErrorSource::*;
                match source {
                    StdIo(e) => {
                        write!(f, "unhandled std::io::Error: {}", e)?;
                    },
                    Serial(e) => {
                        write!(f, "unhandled serial port error: {}", e)?;
                    },
                    Reqwest(e) => {
                        write!(f, "unhandled HTTP error: {}", e)?;
                    },
                    Json(e) => {
                        write!(f, "unhandled JSON error: {}", e)?;
                    },
                    Yaml(e) => {
                        write!(f, "unhandled YAML error: {}", e)?;
                    },
                };
            },
        };

        Ok(())
    }
}

#[derive(Debug)]
/// Error type for device/orchestrator operations. Easily constructed from [ErrorKind].
pub struct Error
{
    pub kind: ErrorKind,
    pub source: Option<BoxedError>,

    /// Stores the backtrace for this error.
    #[cfg(feature = "backtrace")]
    pub backtrace: Box<Backtrace>,

    /// A string for additional context about what was being attempted when this error occurred.
    ///
    /// Example: "reading fw_signature from slave 12 on /dev/ttyRS485-1".
    pub context: Option<String>,
}

impl Error
{
    #[inline(always)]
    pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
    {
        Self {
            kind,
            source,
            context: None,
            #[cfg(feature = "backtrace")]
            backtrace: Box::new(Backtrace::capture()),
        }
    }

    #[allow(dead_code)]
    /// Add additional context about what was being attempted when this error occurred.
    pub fn with_ctx(mut self, ctx: &str) -> Self
    {
        self.context = Some(ctx.to_string());
        self
    }

    #[allow(dead_code)]
    /// Removes previously added context.
    pub fn without_ctx(mut self) -> Self
    {
        self.context = None;
        self
    }

    #[cfg(feature = "backtrace")]
    #[allow(dead_code)]
    fn backtrace(&self) -> Option<&Backtrace>
    {
        Some(&self.backtrace)
    }
}

impl Display for Error
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        if let Some(ctx) = &self.context {
            write!(f, "(while {}): {}", ctx, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }

        #[cfg(feature = "backtrace")]
        {
            if self.backtrace.status() == BacktraceStatus::Captured {
                write!(f, "\nBacktrace:\n{}", self.backtrace)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f, "\nCaused by: {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        self.source.as_deref().map(|e| e as &dyn StdError)
    }
}

impl From<std::io::Error> for Error
{
    fn from(other: std::io::Error) -> Self
    {
        ErrorKind::External(ErrorSource::StdIo(other)).error()
    }
}

impl From<serialport::Error> for Error
{
    fn from(other: serialport::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Serial(other)).error()
    }
}

impl From<reqwest::Error> for Error
{
    fn from(other: reqwest::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Reqwest(other)).error()
    }
}

impl From<serde_json::Error> for Error
{
    fn from(other: serde_json::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Json(other)).error()
    }
}

impl From<serde_yaml::Error> for Error
{
    fn from(other: serde_yaml::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Yaml(other)).error()
    }
}


/// Sources of external error in this library.
#[derive(Debug, Error)]
pub enum ErrorSource
{
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}


/// Extension trait to enable getting the error kind from a Result<T, Error> with one method.
pub trait ResErrorKind<T>
{
    type Kind;
    fn err_kind(&self) -> Result<&T, &Self::Kind>;
}

impl<T> ResErrorKind<T> for Result<T, Error>
{
    type Kind = ErrorKind;

    fn err_kind(&self) -> Result<&T, &Self::Kind>
    {
        self.as_ref().map_err(|e| &e.kind)
    }
}


#[macro_export]
macro_rules! log_and_return
{
    ($err:expr) => {
        let err = $err;
        log::error!("{}", err);
        return Err(err);
    }
}
