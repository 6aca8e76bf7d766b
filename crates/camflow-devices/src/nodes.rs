/*!
 * Camera node table.
 *
 * Maps every GenICam node key to its data type and, for enumerations, the
 * legal values and their labels. Parameter access on a camera is driven by
 * this table.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use camflow_core::error::Error as CoreError;

use crate::error::{DeviceError, Result};

/// Node table shipped with the crate, covering the nodes camflow itself touches
const BUILTIN_NODES: &str = r#"
[[nodes]]
key = "DeviceUserID"
type = "IString"

[[nodes]]
key = "DeviceModelName"
type = "IString"

[[nodes]]
key = "DeviceSerialNumber"
type = "IString"

[[nodes]]
key = "Width"
type = "IInteger"

[[nodes]]
key = "Height"
type = "IInteger"

[[nodes]]
key = "OffsetX"
type = "IInteger"

[[nodes]]
key = "OffsetY"
type = "IInteger"

[[nodes]]
key = "PayloadSize"
type = "IInteger"

[[nodes]]
key = "PixelFormat"
type = "IEnumeration"
enum_range = [
    { value = 17301505, name = "Mono8" },
    { value = 17301513, name = "BayerRG8" },
    { value = 35127316, name = "RGB8Packed" },
]

[[nodes]]
key = "AcquisitionMode"
type = "IEnumeration"
enum_range = [
    { value = 0, name = "SingleFrame" },
    { value = 1, name = "MultiFrame" },
    { value = 2, name = "Continuous" },
]

[[nodes]]
key = "AcquisitionFrameRate"
type = "IFloat"

[[nodes]]
key = "AcquisitionFrameRateEnable"
type = "IBoolean"

[[nodes]]
key = "TriggerMode[TriggerSelector]"
type = "IEnumeration"
enum_range = [
    { value = 0, name = "Off" },
    { value = 1, name = "On" },
]

[[nodes]]
key = "TriggerSource[TriggerSelector]"
type = "IEnumeration"
enum_range = [
    { value = 0, name = "Line0" },
    { value = 1, name = "Line1" },
    { value = 2, name = "Line2" },
    { value = 3, name = "Line3" },
    { value = 4, name = "Counter0" },
    { value = 7, name = "Software" },
    { value = 8, name = "FrequencyConverter" },
]

[[nodes]]
key = "TriggerSoftware[TriggerSelector]"
type = "ICommand"

[[nodes]]
key = "ExposureAuto"
type = "IEnumeration"
enum_range = [
    { value = 0, name = "Off" },
    { value = 1, name = "Once" },
    { value = 2, name = "Continuous" },
]

[[nodes]]
key = "ExposureTime"
type = "IFloat"

[[nodes]]
key = "GainAuto"
type = "IEnumeration"
enum_range = [
    { value = 0, name = "Off" },
    { value = 1, name = "Once" },
    { value = 2, name = "Continuous" },
]

[[nodes]]
key = "Gain"
type = "IFloat"

[[nodes]]
key = "GevCurrentIPAddress"
type = "IInteger"

[[nodes]]
key = "GevSCPSPacketSize[GevStreamChannelSelector]"
type = "IInteger"

[[nodes]]
key = "GevSCPD[GevStreamChannelSelector]"
type = "IInteger"
"#;

/// Data type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// IBoolean
    Boolean,
    /// IEnumeration
    Enumeration,
    /// IFloat
    Float,
    /// IInteger
    Integer,
    /// IString
    String,
    /// ICommand
    Command,
}

impl NodeType {
    /// Parse a type name such as `IEnumeration` (case-insensitive)
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "iboolean" => Ok(NodeType::Boolean),
            "ienumeration" => Ok(NodeType::Enumeration),
            "ifloat" => Ok(NodeType::Float),
            "iinteger" => Ok(NodeType::Integer),
            "istring" => Ok(NodeType::String),
            "icommand" => Ok(NodeType::Command),
            _ => Err(DeviceError::ConfigType(name.trim().to_string())),
        }
    }

    /// The canonical type name
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Boolean => "IBoolean",
            NodeType::Enumeration => "IEnumeration",
            NodeType::Float => "IFloat",
            NodeType::Integer => "IInteger",
            NodeType::String => "IString",
            NodeType::Command => "ICommand",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One legal value of an enumeration node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumEntry {
    /// Integer value
    pub value: i64,
    /// Label
    pub name: String,
}

/// A node as declared in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Node key without the selector suffix
    pub key: String,
    /// Selector the node depends on, if any
    pub depends: Option<String>,
    /// Declared type name, validated when the node is used
    pub type_name: String,
    /// Legal values for enumerations
    pub enum_range: Vec<EnumEntry>,
}

impl NodeEntry {
    /// The parsed data type, or `ConfigType` for an unknown declaration
    pub fn node_type(&self) -> Result<NodeType> {
        NodeType::parse(&self.type_name)
    }

    /// Label of an enumeration value
    pub fn enum_label(&self, value: i64) -> Option<&str> {
        self.enum_range
            .iter()
            .find(|e| e.value == value)
            .map(|e| e.name.as_str())
    }

    /// Value of an enumeration label
    pub fn enum_value(&self, label: &str) -> Option<i64> {
        self.enum_range
            .iter()
            .find(|e| e.name == label)
            .map(|e| e.value)
    }
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    key: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    depends: Option<String>,
    #[serde(default)]
    enum_range: Vec<EnumEntry>,
}

/// Split `Name[Selector]` into the key and its dependency
pub fn split_dependency(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    match raw.find('[') {
        Some(open) => {
            let key = raw[..open].trim().to_string();
            let depends = raw[open + 1..].trim_end_matches(']').trim();
            let depends = (!depends.is_empty()).then(|| depends.to_string());
            (key, depends)
        }
        None => (raw.to_string(), None),
    }
}

/// Key → node lookup
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    entries: BTreeMap<String, NodeEntry>,
}

impl NodeTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The table shipped with the crate
    pub fn builtin() -> Self {
        // parse is exercised by test_builtin_table_parses
        Self::from_toml_str(BUILTIN_NODES).unwrap_or_default()
    }

    /// Parse a TOML node table
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(source)
            .map_err(|e| CoreError::parse(format!("Invalid node table: {}", e)))?;

        let mut table = Self::new();
        for node in raw.nodes {
            let (key, inline_depends) = split_dependency(&node.key);
            table.insert(NodeEntry {
                key,
                depends: node.depends.or(inline_depends),
                type_name: node.type_name,
                enum_range: node.enum_range,
            });
        }
        Ok(table)
    }

    /// Load a TOML node table from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let table = Self::from_toml_str(&source)?;
        debug!("Loaded {} nodes from {}", table.len(), path.display());
        Ok(table)
    }

    /// Add or replace a node
    pub fn insert(&mut self, entry: NodeEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Find a node
    pub fn get(&self, key: &str) -> Option<&NodeEntry> {
        self.entries.get(key)
    }

    /// Find a node, failing with `UnknownParameter`
    pub fn lookup(&self, key: &str) -> Result<&NodeEntry> {
        self.get(key)
            .ok_or_else(|| DeviceError::UnknownParameter(key.to_string()))
    }

    /// Whether the key is declared
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All node keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_table_parses() {
        let table = NodeTable::from_toml_str(BUILTIN_NODES).unwrap();
        assert_eq!(table.len(), NodeTable::builtin().len());

        let trigger = table.lookup("TriggerMode").unwrap();
        assert_eq!(trigger.depends.as_deref(), Some("TriggerSelector"));
        assert_eq!(trigger.node_type().unwrap(), NodeType::Enumeration);
        assert_eq!(trigger.enum_label(1), Some("On"));
        assert_eq!(trigger.enum_value("Off"), Some(0));
        assert_eq!(
            table.lookup("TriggerSoftware").unwrap().node_type().unwrap(),
            NodeType::Command
        );
    }

    #[test]
    fn test_split_dependency() {
        assert_eq!(
            split_dependency(" GevSCPD[GevStreamChannelSelector] "),
            ("GevSCPD".to_string(), Some("GevStreamChannelSelector".to_string()))
        );
        assert_eq!(split_dependency("Width"), ("Width".to_string(), None));
        assert_eq!(split_dependency("Odd[]"), ("Odd".to_string(), None));
    }

    #[test]
    fn test_unknown_type_fails_on_use() {
        let table = NodeTable::from_toml_str(
            r#"
            [[nodes]]
            key = "EventNotification"
            type = "IRegister"
            "#,
        )
        .unwrap();

        let entry = table.lookup("EventNotification").unwrap();
        assert!(matches!(entry.node_type(), Err(DeviceError::ConfigType(t)) if t == "IRegister"));
    }

    #[test]
    fn test_unknown_key() {
        let table = NodeTable::builtin();
        assert!(matches!(
            table.lookup("NoSuchNode"),
            Err(DeviceError::UnknownParameter(k)) if k == "NoSuchNode"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[nodes]]
            key = "LineSelector"
            type = "ienumeration"
            enum_range = [{{ value = 0, name = "Line0" }}]
            "#
        )
        .unwrap();

        let table = NodeTable::load(file.path()).unwrap();
        assert_eq!(
            table.lookup("LineSelector").unwrap().node_type().unwrap(),
            NodeType::Enumeration
        );
        assert!(NodeTable::load("/nonexistent/nodes.toml").is_err());
    }
}
