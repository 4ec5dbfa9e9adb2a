//! Core of the `siconvert` tool: reads serialized objects in one format
//! and writes them in another, with every codec going through the same
//! intermediate tree.

use std::io::Write;

use axon_ser::{
    BinParser, BinStatus, SerError, SerializationInfo, parse_csv, parse_json_stream,
    parse_query_string, parse_xml, to_bin, to_csv, to_json, to_properties, to_xml,
};
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Binary,
    Xml,
    Json,
    Csv,
    QueryString,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Binary,
    /// XML with scalar members as attributes.
    Xml,
    /// XML with members as child elements only.
    XmlPlain,
    Json,
    Csv,
    Properties,
    /// Only count the objects; the count prints at the end.
    Count,
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Ser(#[from] SerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct Options {
    pub input: InputFormat,
    pub output: OutputFormat,
    pub beautify: bool,
    pub skip: u64,
    pub num: Option<u64>,
}

/// Streams objects from inputs to one output, applying skip/num and
/// counting what was written.
pub struct Converter {
    options: Options,
    skip: u64,
    remaining: Option<u64>,
    count: u64,
}

impl Converter {
    pub fn new(options: Options) -> Self {
        Converter { skip: options.skip, remaining: options.num, count: 0, options }
    }

    /// Objects written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// False once `--num` is exhausted.
    pub fn wants_more(&self) -> bool {
        self.remaining != Some(0)
    }

    fn parse_all(&self, input: &[u8]) -> Result<Vec<SerializationInfo>, ConvertError> {
        match self.options.input {
            InputFormat::Binary => {
                let mut objects = Vec::new();
                let mut parser = BinParser::new();
                let mut rest = input;
                while !rest.is_empty() {
                    match parser.advance(rest)? {
                        BinStatus::Complete { consumed } => {
                            rest = &rest[consumed..];
                            objects.push(parser.take()?);
                            parser = BinParser::new();
                        }
                        BinStatus::NeedMore => {
                            return Err(SerError::UnexpectedEnd("binary").into());
                        }
                    }
                }
                Ok(objects)
            }
            InputFormat::Xml => Ok(vec![parse_xml(str_input(input)?)?]),
            InputFormat::Json => Ok(parse_json_stream(str_input(input)?)?),
            InputFormat::Csv => Ok(vec![parse_csv(str_input(input)?, ',')?]),
            InputFormat::QueryString => Ok(vec![parse_query_string(str_input(input)?.trim())?]),
        }
    }

    fn emit(&self, si: &SerializationInfo, out: &mut dyn Write) -> Result<(), ConvertError> {
        match self.options.output {
            OutputFormat::Binary => out.write_all(&to_bin(si)?)?,
            OutputFormat::Xml => {
                out.write_all(to_xml(si, "root", self.options.beautify, true)?.as_bytes())?;
                out.write_all(b"\n")?;
            }
            OutputFormat::XmlPlain => {
                out.write_all(to_xml(si, "root", self.options.beautify, false)?.as_bytes())?;
                out.write_all(b"\n")?;
            }
            OutputFormat::Json => {
                out.write_all(to_json(si, self.options.beautify)?.as_bytes())?;
                out.write_all(b"\n")?;
            }
            OutputFormat::Csv => out.write_all(to_csv(si)?.as_bytes())?,
            OutputFormat::Properties => out.write_all(to_properties(si)?.as_bytes())?,
            OutputFormat::Count => {}
        }
        Ok(())
    }

    /// Converts every object found in `input`.
    pub fn convert(&mut self, input: &[u8], out: &mut dyn Write) -> Result<(), ConvertError> {
        for si in self.parse_all(input)? {
            if !self.wants_more() {
                break;
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            self.emit(&si, out)?;
            self.count += 1;
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
        }
        Ok(())
    }

    /// Writes the trailing count line for `-N`.
    pub fn finish(&self, out: &mut dyn Write) -> Result<(), ConvertError> {
        if self.options.output == OutputFormat::Count {
            writeln!(out, "{}", self.count)?;
        }
        Ok(())
    }
}

fn str_input(input: &[u8]) -> Result<&str, ConvertError> {
    Ok(std::str::from_utf8(input)
        .map_err(|_| SerError::parse("input", 0, "input is not valid utf-8"))?)
}

/// Runs a whole conversion: every path in `files` (stdin when empty)
/// through `converter` into `out`.
pub fn run(
    converter: &mut Converter,
    files: &[std::path::PathBuf],
    out: &mut dyn Write,
    verbose: bool,
) -> Result<(), ConvertError> {
    if files.is_empty() {
        let mut input = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin().lock(), &mut input)?;
        converter.convert(&input, out)?;
    } else {
        for path in files {
            if verbose {
                eprintln!("process <{}>", path.display());
            }
            let input = std::fs::read(path)?;
            converter.convert(&input, out)?;
            if !converter.wants_more() {
                break;
            }
        }
    }
    converter.finish(out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(input: InputFormat, output: OutputFormat) -> Options {
        Options { input, output, beautify: false, skip: 0, num: None }
    }

    fn convert_bytes(opts: Options, input: &[u8]) -> Vec<u8> {
        let mut converter = Converter::new(opts);
        let mut out = Vec::new();
        converter.convert(input, &mut out).unwrap();
        converter.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn json_to_csv() {
        let json = br#"[{"a":1,"b":"x,y"},{"a":2,"b":"z"}]"#;
        let out = convert_bytes(options(InputFormat::Json, OutputFormat::Csv), json);
        assert_eq!(out, b"a,b\r\n1,\"x,y\"\r\n2,z\r\n");
    }

    #[test]
    fn csv_to_json() {
        let out = convert_bytes(
            options(InputFormat::Csv, OutputFormat::Json),
            b"a,b\r\n1,2\r\n",
        );
        assert_eq!(out, b"[{\"a\":\"1\",\"b\":\"2\"}]\n");
    }

    #[test]
    fn json_to_binary_and_back() {
        let json = br#"{"name":"conv","n":5}"#;
        let bin = convert_bytes(options(InputFormat::Json, OutputFormat::Binary), json);
        let back = convert_bytes(options(InputFormat::Binary, OutputFormat::Json), &bin);
        assert_eq!(back, b"{\"name\":\"conv\",\"n\":5}\n");
    }

    #[test]
    fn query_string_to_json() {
        let out = convert_bytes(
            options(InputFormat::QueryString, OutputFormat::Json),
            b"a=1&msg=hello%20world",
        );
        assert_eq!(out, b"{\"a\":\"1\",\"msg\":\"hello world\"}\n");
    }

    #[test]
    fn xml_to_properties() {
        let out = convert_bytes(
            options(InputFormat::Xml, OutputFormat::Properties),
            b"<cfg><port type=\"int\">8080</port><host>local</host></cfg>",
        );
        assert_eq!(out, b"cfg.port = 8080\ncfg.host = local\n");
    }

    #[test]
    fn skip_and_num() {
        let json = b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n{\"n\":4}\n";
        let mut opts = options(InputFormat::Json, OutputFormat::Json);
        opts.skip = 1;
        opts.num = Some(2);
        let out = convert_bytes(opts, json);
        assert_eq!(out, b"{\"n\":2}\n{\"n\":3}\n");
    }

    #[test]
    fn count_only() {
        let json = b"{\"n\":1} {\"n\":2} {\"n\":3}";
        let out = convert_bytes(options(InputFormat::Json, OutputFormat::Count), json);
        assert_eq!(out, b"3\n");
    }

    #[test]
    fn conversion_error_surfaces() {
        let mut converter = Converter::new(options(InputFormat::Json, OutputFormat::Json));
        let mut out = Vec::new();
        assert!(converter.convert(b"{ nope", &mut out).is_err());
    }

    #[test]
    fn run_over_files() {
        use std::io::Write as _;

        let mut a = tempfile::NamedTempFile::new().unwrap();
        a.write_all(b"{\"v\":1}").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        b.write_all(b"{\"v\":2}").unwrap();

        let mut converter =
            Converter::new(options(InputFormat::Json, OutputFormat::Json));
        let mut out = Vec::new();
        run(
            &mut converter,
            &[a.path().to_path_buf(), b.path().to_path_buf()],
            &mut out,
            false,
        )
        .unwrap();
        assert_eq!(out, b"{\"v\":1}\n{\"v\":2}\n");
        assert_eq!(converter.count(), 2);
    }
}
