//! The final snapshot of a replay and its text encodings.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};

use crate::error::{Error, Result};
use crate::event::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveAllocation {
    pub caller: Address,
    pub size: u64,
}

/// Live buffers keyed by address and outstanding allocation counts keyed by call
/// site. Zero counts are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub status: BTreeMap<Address, LiveAllocation>,
    pub callers: BTreeMap<Address, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    PrettyJson,
    Yaml,
}

impl Default for Format {
    fn default() -> Self {
        Format::PrettyJson
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Format::Json),
            "pjson" => Ok(Format::PrettyJson),
            "yaml" => Ok(Format::Yaml),
            other => Err(Error::UnknownSerializer(other.to_string())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Json => "json",
            Format::PrettyJson => "pjson",
            Format::Yaml => "yaml",
        })
    }
}

/// Single line JSON with a space after every `,` and `:`, the way Python's
/// `json.dumps` lays it out.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}

impl Report {
    /// Encodes the report followed by a newline.
    pub fn write<W: Write>(&self, format: Format, mut writer: W) -> Result<()> {
        match format {
            Format::Json => {
                let mut ser = serde_json::Serializer::with_formatter(&mut writer, SpacedFormatter);
                self.serialize(&mut ser)?;
            }
            Format::PrettyJson => {
                let formatter = PrettyFormatter::with_indent(b"    ");
                let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
                self.serialize(&mut ser)?;
            }
            // serde_yaml already terminates its document
            Format::Yaml => return Ok(serde_yaml::to_writer(writer, self)?),
        }
        writeln!(writer)?;
        Ok(())
    }

    pub fn encode(&self, format: Format) -> Result<String> {
        let mut buf = Vec::new();
        self.write(format, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Report {
        Report {
            status: BTreeMap::from([
                (
                    Address(0x200),
                    LiveAllocation {
                        caller: Address(0x2),
                        size: 32,
                    },
                ),
                (
                    Address(0x1f),
                    LiveAllocation {
                        caller: Address(0xAB),
                        size: 8,
                    },
                ),
            ]),
            callers: BTreeMap::from([(Address(0x2), 1), (Address(0xab), 1)]),
        }
    }

    #[test]
    fn format_names() {
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("pjson".parse::<Format>().unwrap(), Format::PrettyJson);
        assert_eq!("yaml".parse::<Format>().unwrap(), Format::Yaml);
        assert_eq!(Format::default().to_string(), "pjson");

        let err = "xml".parse::<Format>().unwrap_err();
        assert_eq!(err.to_string(), "unknown serializer: xml");
    }

    #[test]
    fn compact_json() {
        assert_eq!(
            sample().encode(Format::Json).unwrap(),
            concat!(
                r#"{"status": {"0x1f": {"caller": "0xab", "size": 8}, "#,
                r#""0x200": {"caller": "0x2", "size": 32}}, "#,
                r#""callers": {"0x2": 1, "0xab": 1}}"#,
                "\n"
            )
        );
    }

    #[test]
    fn pretty_json_uses_four_spaces() {
        let expected = r#"{
    "status": {
        "0x1f": {
            "caller": "0xab",
            "size": 8
        },
        "0x200": {
            "caller": "0x2",
            "size": 32
        }
    },
    "callers": {
        "0x2": 1,
        "0xab": 1
    }
}
"#;
        assert_eq!(sample().encode(Format::PrettyJson).unwrap(), expected);
    }

    #[test]
    fn empty_report() {
        assert_eq!(
            Report::default().encode(Format::Json).unwrap(),
            "{\"status\": {}, \"callers\": {}}\n"
        );
    }

    #[test]
    fn yaml_round_trips_through_a_value() {
        let text = sample().encode(Format::Yaml).unwrap();
        assert!(text.ends_with('\n'));

        let value: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(value["status"]["0x200"]["caller"].as_str(), Some("0x2"));
        assert_eq!(value["status"]["0x1f"]["size"].as_u64(), Some(8));
        assert_eq!(value["callers"]["0xab"].as_i64(), Some(1));
    }

    #[test]
    fn negative_counts_are_reported() {
        let report = Report {
            status: BTreeMap::new(),
            callers: BTreeMap::from([(Address(0x5), -2)]),
        };
        assert_eq!(
            report.encode(Format::Json).unwrap(),
            "{\"status\": {}, \"callers\": {\"0x5\": -2}}\n"
        );
    }
}
