//! Format-neutral serialization.
//!
//! [`SerializationInfo`] is a tagged tree sitting between user types and
//! wire encodings. A [`Formatter`] is a sink of tree-walk events; each
//! codec module pairs a formatter with a parser that rebuilds the tree,
//! so any format converts to any other through the same intermediate
//! representation.

mod binfmt;
mod convert;
mod csv;
mod envsubst;
mod error;
mod formatter;
mod json;
mod props;
mod qparams;
mod si;
mod xml;

pub use binfmt::{BinFormatter, BinParser, BinStatus, Tag, parse_bin, to_bin};
pub use convert::{FromSi, ToSi, from_si, to_si};
pub use csv::{CsvFormatter, parse_csv, to_csv};
pub use envsubst::{env_subst, env_subst_with};
pub use error::SerError;
pub use formatter::{Formatter, SiBuilder, format_si};
pub use json::{JsonFormatter, parse_json, parse_json_stream, to_json};
pub use props::{PropertiesFormatter, to_properties};
pub use qparams::parse_query_string;
pub use si::{Category, ScalarValue, SerializationInfo};
pub use xml::{XmlFormatter, parse_xml, to_xml};
