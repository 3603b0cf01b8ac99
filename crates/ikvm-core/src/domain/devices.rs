//! Device descriptors reported by the iKVM server and the validated value
//! types used to describe them.
//!
//! Every value type here is validated exactly once, when it is constructed
//! (`new`, `FromStr`, `TryFrom<String>`).  Once a [`Resolution`] or a
//! [`UsbId`] exists it is known to be in range, so the selection policy and
//! the codec never have to re-check it.
//!
//! The text forms match what users type on the command line and in the config
//! file:
//!
//! | Type            | Example       |
//! |-----------------|---------------|
//! | [`UsbId`]       | `0483:df11`   |
//! | [`Resolution`]  | `1920x1080`   |
//! | [`AspectRatio`] | `16:9`        |
//! | [`FrameRate`]   | `30`          |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected input at a value-construction boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("invalid USB id {0:?}: expected vid:pid in hex, e.g. 0483:df11")]
    UsbId(String),

    #[error("invalid resolution {0:?}: expected WIDTHxHEIGHT with both in 1..=65535, e.g. 1920x1080")]
    Resolution(String),

    #[error("invalid aspect ratio {0:?}: expected W:H with both in 1..=65535, e.g. 16:9")]
    AspectRatio(String),

    #[error("invalid frame rate {0:?}: expected an integer in 1..=255")]
    FrameRate(String),

    #[error("invalid capture quality {0:?}: expected \"best\" or \"worst\"")]
    Quality(String),

    #[error("invalid key action {0:?}: expected \"press\" or \"release\"")]
    KeyAction(String),

    #[error("invalid ATX signal {0:?}: expected \"short power\", \"reset\" or \"long power\"")]
    AtxSignal(String),

    #[error("text contains a non-ASCII character at byte {0}")]
    NonAscii(usize),

    #[error("text of {0} bytes exceeds the 65535-byte limit")]
    TextTooLong(usize),
}

// ── USB id ────────────────────────────────────────────────────────────────────

/// USB vendor/product id pair of a serial adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl FromStr for UsbId {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ValueError::UsbId(s.to_string());
        let (vid, pid) = s.split_once(':').ok_or_else(err)?;
        let parse = |part: &str| {
            if part.is_empty() || part.len() > 4 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(err());
            }
            u16::from_str_radix(part, 16).map_err(|_| err())
        };
        Ok(Self::new(parse(vid)?, parse(pid)?))
    }
}

impl TryFrom<String> for UsbId {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbId> for String {
    fn from(value: UsbId) -> Self {
        value.to_string()
    }
}

// ── Resolution / aspect ratio ─────────────────────────────────────────────────

/// Capture resolution in pixels.  Both sides are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    width: u16,
    height: u16,
}

impl Resolution {
    /// Returns `None` when either side is zero.
    pub const fn new(width: u16, height: u16) -> Option<Self> {
        if width == 0 || height == 0 {
            None
        } else {
            Some(Self { width, height })
        }
    }

    pub const fn width(&self) -> u16 {
        self.width
    }

    pub const fn height(&self) -> u16 {
        self.height
    }

    pub const fn area(&self) -> u32 {
        self.width as u32 * self.height as u32
    }

    /// The reduced width:height ratio, e.g. 1920x1080 → 16:9.
    pub fn aspect_ratio(&self) -> AspectRatio {
        AspectRatio::reduced(self.width, self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ValueError::Resolution(s.to_string());
        let (w, h) = s.split_once('x').ok_or_else(err)?;
        let w: u16 = w.trim().parse().map_err(|_| err())?;
        let h: u16 = h.trim().parse().map_err(|_| err())?;
        Self::new(w, h).ok_or_else(err)
    }
}

impl TryFrom<String> for Resolution {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// A width:height ratio, always stored in lowest terms so that `32:18` and
/// `16:9` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    width: u16,
    height: u16,
}

impl AspectRatio {
    /// Returns `None` when either side is zero.
    pub fn new(width: u16, height: u16) -> Option<Self> {
        if width == 0 || height == 0 {
            None
        } else {
            Some(Self::reduced(width, height))
        }
    }

    fn reduced(width: u16, height: u16) -> Self {
        let divisor = gcd(width, height).max(1);
        Self {
            width: width / divisor,
            height: height / divisor,
        }
    }

    pub const fn width(&self) -> u16 {
        self.width
    }

    pub const fn height(&self) -> u16 {
        self.height
    }
}

fn gcd(mut a: u16, mut b: u16) -> u16 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ValueError::AspectRatio(s.to_string());
        let (w, h) = s.split_once(':').ok_or_else(err)?;
        let w: u16 = w.trim().parse().map_err(|_| err())?;
        let h: u16 = h.trim().parse().map_err(|_| err())?;
        Self::new(w, h).ok_or_else(err)
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.to_string()
    }
}

// ── Frame rate ────────────────────────────────────────────────────────────────

/// Frames per second requested from the capture device (1..=255).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FrameRate(u8);

impl FrameRate {
    pub const fn new(fps: u8) -> Option<Self> {
        if fps == 0 {
            None
        } else {
            Some(Self(fps))
        }
    }

    pub const fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for FrameRate {
    type Error = ValueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| ValueError::FrameRate(value.to_string()))
    }
}

impl From<FrameRate> for u8 {
    fn from(value: FrameRate) -> Self {
        value.0
    }
}

impl FromStr for FrameRate {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ValueError::FrameRate(s.to_string()))
    }
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// A serial device (the USB HID bridge) attached to the iKVM server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDevice {
    /// Device path on the server, e.g. `/dev/ttyUSB0`.
    pub name: String,
    pub usb_id: UsbId,
}

/// One resolution a capture device supports, with the frame rates available
/// at that resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMode {
    pub resolution: Resolution,
    pub frame_rates: Vec<FrameRate>,
}

/// A video capture device attached to the iKVM server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCapture {
    /// Device path on the server, e.g. `/dev/video0`.
    pub name: String,
    pub modes: Vec<CaptureMode>,
}

impl VideoCapture {
    /// Every resolution the device offers, in server order.
    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.modes.iter().map(|m| m.resolution)
    }

    /// The mode for `resolution`, if the device offers it.
    pub fn mode(&self, resolution: Resolution) -> Option<&CaptureMode> {
        self.modes.iter().find(|m| m.resolution == resolution)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
