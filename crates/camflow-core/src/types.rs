/*!
 * Core data types for camflow.
 *
 * This module defines the identifiers, parameter values, and camera vocabulary
 * enums shared by every camflow crate.
 */
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A stable device identifier, normally the camera's IPv4 address
///
/// Ordering is plain string ordering, which is the order every fan-out
/// result is reported in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the ID as an IPv4 address
    pub fn to_ipv4(&self) -> Result<Ipv4Addr> {
        Ok(self.0.parse::<Ipv4Addr>()?)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Ipv4Addr> for Id {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip.to_string())
    }
}

/// A camera parameter value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Permission level a device connection is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Exclusive access, other applications may only read CCP registers
    Exclusive,
    /// Control access, other applications may read every register
    Control,
    /// Read-only monitor access alongside a controlling application
    Monitor,
}

impl AccessMode {
    /// The vendor access code
    pub fn code(&self) -> u32 {
        match self {
            AccessMode::Exclusive => 1,
            AccessMode::Control => 3,
            AccessMode::Monitor => 7,
        }
    }

    /// Look up a mode by vendor access code
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(AccessMode::Exclusive),
            3 => Ok(AccessMode::Control),
            7 => Ok(AccessMode::Monitor),
            other => Err(Error::parse(format!("unknown access mode code {}", other))),
        }
    }

    /// Whether the mode holds the device exclusively
    pub fn is_exclusive(&self) -> bool {
        *self == AccessMode::Exclusive
    }

    /// Whether parameter writes are permitted under this mode
    pub fn has_control_permission(&self) -> bool {
        matches!(self, AccessMode::Exclusive | AccessMode::Control)
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exclusive" => Ok(AccessMode::Exclusive),
            "control" => Ok(AccessMode::Control),
            "monitor" => Ok(AccessMode::Monitor),
            other => Err(Error::parse(format!("unknown access mode '{}'", other))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame acquisition strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabMethod {
    /// Poll into a caller-owned buffer with an explicit timeout
    GetOneFrameTimeout,
    /// Poll for an SDK-owned buffer which must be released after use
    GetImageBuffer,
    /// Frames are pushed to a callback on an SDK-owned thread
    ImageCallback,
}

impl GrabMethod {
    /// Numeric code used in parameter files
    pub fn code(&self) -> i64 {
        match self {
            GrabMethod::GetOneFrameTimeout => 1,
            GrabMethod::GetImageBuffer => 2,
            GrabMethod::ImageCallback => 3,
        }
    }

    /// Look up a method by numeric code
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(GrabMethod::GetOneFrameTimeout),
            2 => Ok(GrabMethod::GetImageBuffer),
            3 => Ok(GrabMethod::ImageCallback),
            other => Err(Error::parse(format!("unknown grab method code {}", other))),
        }
    }
}

impl FromStr for GrabMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "get_one_frame_timeout" => Ok(GrabMethod::GetOneFrameTimeout),
            "get_image_buffer" => Ok(GrabMethod::GetImageBuffer),
            "image_callback" => Ok(GrabMethod::ImageCallback),
            other => Err(Error::parse(format!("unknown grab method '{}'", other))),
        }
    }
}

impl fmt::Display for GrabMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the native handle is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateHandleMethod {
    /// Connect directly by IP address without enumeration
    Direct,
    /// Enumerate the transport and pick the matching device
    Enumerate,
}

impl CreateHandleMethod {
    /// Look up a method by numeric code (0 = direct, 1 = enumerate)
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(CreateHandleMethod::Direct),
            1 => Ok(CreateHandleMethod::Enumerate),
            other => Err(Error::parse(format!("unknown create handle method code {}", other))),
        }
    }
}

impl FromStr for CreateHandleMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(CreateHandleMethod::Direct),
            "enumerate" | "enum" => Ok(CreateHandleMethod::Enumerate),
            other => Err(Error::parse(format!("unknown create handle method '{}'", other))),
        }
    }
}

impl fmt::Display for CreateHandleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Image rotation applied after conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// 90 degrees clockwise
    Cw90,
    /// 180 degrees
    Cw180,
    /// 90 degrees counter-clockwise
    Ccw90,
    /// No rotation
    #[default]
    None,
}

impl Rotation {
    /// Numeric code (0 = cw90, 1 = cw180, 2 = ccw90, 3 = none)
    pub fn code(&self) -> i64 {
        match self {
            Rotation::Cw90 => 0,
            Rotation::Cw180 => 1,
            Rotation::Ccw90 => 2,
            Rotation::None => 3,
        }
    }

    /// Look up a rotation by numeric code
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Rotation::Cw90),
            1 => Ok(Rotation::Cw180),
            2 => Ok(Rotation::Ccw90),
            3 => Ok(Rotation::None),
            other => Err(Error::parse(format!("unknown rotation code {}", other))),
        }
    }

    /// Whether the rotation swaps width and height
    pub fn is_90(&self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Ccw90)
    }
}

impl FromStr for Rotation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cw90" => Ok(Rotation::Cw90),
            "cw180" => Ok(Rotation::Cw180),
            "ccw90" => Ok(Rotation::Ccw90),
            "none" => Ok(Rotation::None),
            other => Err(Error::parse(format!("unknown rotation '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering_and_conversion() {
        let mut ids: Vec<Id> = vec!["192.168.1.20".into(), "192.168.1.10".into()];
        ids.sort();
        assert_eq!(ids[0].as_str(), "192.168.1.10");

        let id: Id = Ipv4Addr::new(10, 0, 0, 5).into();
        assert_eq!(id.to_ipv4().unwrap(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(Id::from_string("camera-a").to_ipv4().is_err());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Integer(42).as_float(), Some(42.0));
        assert_eq!(Value::Float(3.0).as_integer(), Some(3));
        assert_eq!(Value::Float(3.5).as_integer(), None);
        assert_eq!(Value::from("Off").as_str(), Some("Off"));
        assert!(Value::from(None::<f64>).is_null());
        assert_eq!(Value::from(vec![Value::Integer(1), Value::Integer(2)]).to_string(), "(1, 2)");
    }

    #[test]
    fn test_access_mode_codes() {
        assert_eq!(AccessMode::from_code(7).unwrap(), AccessMode::Monitor);
        assert!(AccessMode::from_code(2).is_err());
        assert!(AccessMode::Control.has_control_permission());
        assert!(!AccessMode::Monitor.has_control_permission());
        assert!(!AccessMode::Control.is_exclusive());
        assert_eq!("monitor".parse::<AccessMode>().unwrap(), AccessMode::Monitor);
    }

    #[test]
    fn test_rotation_codes() {
        for code in 0..4 {
            assert_eq!(Rotation::from_code(code).unwrap().code(), code);
        }
        assert!(Rotation::Ccw90.is_90());
        assert!(!Rotation::Cw180.is_90());
    }

    #[test]
    fn test_grab_method_codes() {
        assert_eq!(GrabMethod::from_code(3).unwrap(), GrabMethod::ImageCallback);
        assert_eq!("get_image_buffer".parse::<GrabMethod>().unwrap(), GrabMethod::GetImageBuffer);
        assert_eq!(CreateHandleMethod::from_code(1).unwrap(), CreateHandleMethod::Enumerate);
    }
}
