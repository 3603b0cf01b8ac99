//! Device selection policy.
//!
//! Given the device lists the server reports, decide which serial device to
//! open and which capture mode to stream.  These are pure functions so the
//! policy can be tested without a server.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::devices::{AspectRatio, FrameRate, Resolution, SerialDevice, UsbId, ValueError, VideoCapture};

/// Why no device could be chosen.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no serial device on the iKVM server")]
    NoSerialDevice,

    #[error("no serial device with USB id {0} on the iKVM server")]
    NoSerialDeviceWithId(UsbId),

    #[error("no video capture on the iKVM server")]
    NoCapture,

    #[error("no video capture matching {0:?}")]
    NoCaptureNamed(String),

    #[error("video capture {0:?} offers no usable mode")]
    NoUsableMode(String),
}

/// Whether to prefer the largest or the smallest capture mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Quality {
    #[default]
    Best,
    Worst,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Best => "best",
            Quality::Worst => "worst",
        })
    }
}

impl FromStr for Quality {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(Quality::Best),
            "worst" => Ok(Quality::Worst),
            _ => Err(ValueError::Quality(s.to_string())),
        }
    }
}

impl TryFrom<String> for Quality {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quality> for String {
    fn from(value: Quality) -> Self {
        value.to_string()
    }
}

/// Caller preferences for [`select_capture`].  Every field is optional; the
/// defaults pick the first capture at its best mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturePreference {
    /// Substring of the capture device name.
    pub name: Option<String>,
    /// Preferred aspect ratio when the resolution is left to the policy.
    pub scale: Option<AspectRatio>,
    pub quality: Quality,
    pub resolution: Option<Resolution>,
    pub fps: Option<FrameRate>,
}

/// The capture device and mode the policy settled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureChoice {
    pub device: String,
    pub resolution: Resolution,
    pub fps: FrameRate,
}

impl fmt::Display for CaptureChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.device, self.resolution, self.fps)
    }
}

/// Picks the serial device to open: the first one matching `usb_id` when
/// given, else the first one listed.
///
/// # Errors
///
/// [`SelectionError::NoSerialDevice`] for an empty list,
/// [`SelectionError::NoSerialDeviceWithId`] when nothing matches `usb_id`.
pub fn select_serial(devices: &[SerialDevice], usb_id: Option<UsbId>) -> Result<&SerialDevice, SelectionError> {
    if devices.is_empty() {
        return Err(SelectionError::NoSerialDevice);
    }
    match usb_id {
        Some(id) => devices
            .iter()
            .find(|d| d.usb_id == id)
            .ok_or(SelectionError::NoSerialDeviceWithId(id)),
        None => Ok(&devices[0]),
    }
}

/// Picks the capture device, resolution and frame rate to stream.
///
/// - Device: the first whose name contains `pref.name`, else the first listed.
/// - Resolution and rate: without `pref.resolution`, every (resolution, rate)
///   combination whose aspect ratio equals `pref.scale` (all of them when none
///   match) is ranked by area, then rate.  [`Quality::Best`] takes the
///   largest, [`Quality::Worst`] the smallest; exact ties go to the earlier
///   combination.  `pref.fps` overrides the ranked rate.
/// - With an explicit `pref.resolution`, the rate is `pref.fps` or the max/min
///   rate of that resolution.  A resolution the device does not list uses the
///   rates of its first mode.
///
/// # Errors
///
/// [`SelectionError::NoCapture`] for an empty list,
/// [`SelectionError::NoCaptureNamed`] when no name contains `pref.name`.
pub fn select_capture(captures: &[VideoCapture], pref: &CapturePreference) -> Result<CaptureChoice, SelectionError> {
    let first = captures.first().ok_or(SelectionError::NoCapture)?;
    let cap = match pref.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => captures
            .iter()
            .find(|c| c.name.contains(name))
            .ok_or_else(|| SelectionError::NoCaptureNamed(name.to_string()))?,
        None => first,
    };

    let (resolution, fps) = match pref.resolution {
        Some(r) => {
            let fps = match pref.fps {
                Some(f) => f,
                None => cap
                    .mode(r)
                    .or_else(|| cap.modes.first())
                    .and_then(|mode| pick(&mode.frame_rates, pref.quality, |f| f.get()))
                    .ok_or_else(|| SelectionError::NoUsableMode(cap.name.clone()))?,
            };
            (r, fps)
        }
        None => {
            let combos: Vec<(Resolution, FrameRate)> = cap
                .modes
                .iter()
                .flat_map(|m| m.frame_rates.iter().map(move |&f| (m.resolution, f)))
                .collect();
            let matching: Vec<(Resolution, FrameRate)> = combos
                .iter()
                .copied()
                .filter(|(r, _)| Some(r.aspect_ratio()) == pref.scale)
                .collect();
            let candidates = if matching.is_empty() { combos } else { matching };
            let (r, f) = pick(&candidates, pref.quality, |(r, f)| (r.area(), f.get()))
                .ok_or_else(|| SelectionError::NoUsableMode(cap.name.clone()))?;
            (r, pref.fps.unwrap_or(f))
        }
    };

    Ok(CaptureChoice {
        device: cap.name.clone(),
        resolution,
        fps,
    })
}

/// First maximum (best) or first minimum (worst) of `items` by `key`.
fn pick<T: Copy, K: Ord>(items: &[T], quality: Quality, key: impl Fn(&T) -> K) -> Option<T> {
    let (first, rest) = items.split_first()?;
    let mut best = *first;
    for item in rest {
        let better = match quality {
            Quality::Best => key(item) > key(&best),
            Quality::Worst => key(item) < key(&best),
        };
        if better {
            best = *item;
        }
    }
    Some(best)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
