use std::io::Write;

use tracing::debug;

use crate::{Category, Formatter, ScalarValue, SerError, SerializationInfo, formatter::SiBuilder};

/// Emits CSV from the formatter event stream.
///
/// Column titles are either selected up front with
/// [`select_column`](Self::select_column) or collected from the member
/// names of the first object. A field is quoted whenever it contains the
/// delimiter, the quote character or a line break; embedded quotes are
/// doubled.
pub struct CsvFormatter<W: Write> {
    out: W,
    builder: SiBuilder,
    titles: Vec<(String, String)>,
    delimiter: char,
    quote: char,
    line_ending: &'static str,
}

impl<W: Write> CsvFormatter<W> {
    pub fn new(out: W) -> Self {
        CsvFormatter {
            out,
            builder: SiBuilder::new(),
            titles: Vec::new(),
            delimiter: ',',
            quote: '"',
            line_ending: "\r\n",
        }
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn line_ending(mut self, ending: &'static str) -> Self {
        self.line_ending = ending;
        self
    }

    /// Selects a column explicitly; disables automatic title collection.
    pub fn select_column(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        self.titles.push((title.clone(), title));
        self
    }

    /// Selects a column whose printed title differs from the member name.
    pub fn select_column_as(
        mut self,
        member_name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        self.titles.push((member_name.into(), title.into()));
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn field(&self, value: &str) -> String {
        let needs_quoting = value.contains(self.delimiter)
            || value.contains(self.quote)
            || value.contains('\n')
            || value.contains('\r');
        if !needs_quoting {
            return value.to_string();
        }
        let mut out = String::with_capacity(value.len() + 2);
        out.push(self.quote);
        for ch in value.chars() {
            if ch == self.quote {
                out.push(self.quote);
            }
            out.push(ch);
        }
        out.push(self.quote);
        out
    }

    fn write_row(&mut self, cells: &[String]) -> Result<(), SerError> {
        for (n, cell) in cells.iter().enumerate() {
            if n > 0 {
                write!(self.out, "{}", self.delimiter)?;
            }
            self.out.write_all(cell.as_bytes())?;
        }
        self.out.write_all(self.line_ending.as_bytes())?;
        Ok(())
    }

    fn object_row(&mut self, si: &SerializationInfo) -> Result<(), SerError> {
        let mut cells = vec![String::new(); self.titles.len()];
        for member in si.members() {
            if let Some(col) = self.titles.iter().position(|(name, _)| name == member.name()) {
                cells[col] = self.field(&member.as_str());
            }
        }
        self.write_row(&cells)
    }

    fn write_tree(&mut self, si: &SerializationInfo) -> Result<(), SerError> {
        match si.category() {
            Category::Array => {
                if self.titles.is_empty() {
                    if let Some(first) = si.member_at(0)
                        && first.category() == Category::Object
                    {
                        self.titles = first
                            .members()
                            .iter()
                            .map(|m| (m.name().to_string(), m.name().to_string()))
                            .collect();
                        debug!(columns = self.titles.len(), "titles collected from first object");
                    }
                }
                if !self.titles.is_empty() {
                    let row: Vec<String> =
                        self.titles.iter().map(|(_, t)| self.field(t)).collect();
                    self.write_row(&row)?;
                }
                for member in si.members() {
                    match member.category() {
                        Category::Object => self.object_row(member)?,
                        Category::Array => {
                            let row: Vec<String> =
                                member.members().iter().map(|m| self.field(&m.as_str())).collect();
                            self.write_row(&row)?;
                        }
                        _ => {
                            let cell = self.field(&member.as_str());
                            self.write_row(&[cell])?;
                        }
                    }
                }
            }
            Category::Object => {
                // a single object becomes a single-row table
                if self.titles.is_empty() {
                    self.titles = si
                        .members()
                        .iter()
                        .map(|m| (m.name().to_string(), m.name().to_string()))
                        .collect();
                }
                let row: Vec<String> = self.titles.iter().map(|(_, t)| self.field(t)).collect();
                self.write_row(&row)?;
                self.object_row(si)?;
            }
            _ => {
                let cell = self.field(&si.as_str());
                self.write_row(&[cell])?;
            }
        }
        Ok(())
    }
}

impl<W: Write> Formatter for CsvFormatter<W> {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        id: &str,
    ) -> Result<(), SerError> {
        self.builder.add_value(name, type_name, value, id)
    }

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError> {
        self.builder.add_reference(name, target)
    }

    fn begin_object(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.builder.begin_object(name, type_name, id)
    }

    fn begin_member(&mut self, name: &str) -> Result<(), SerError> {
        self.builder.begin_member(name)
    }

    fn finish_member(&mut self) -> Result<(), SerError> {
        self.builder.finish_member()
    }

    fn finish_object(&mut self) -> Result<(), SerError> {
        self.builder.finish_object()
    }

    fn begin_array(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.builder.begin_array(name, type_name, id)
    }

    fn finish_array(&mut self) -> Result<(), SerError> {
        self.builder.finish_array()
    }

    fn finish(&mut self) -> Result<(), SerError> {
        let si = self.builder.take()?;
        self.write_tree(&si)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Serializes `si` to CSV with the default settings.
pub fn to_csv(si: &SerializationInfo) -> Result<String, SerError> {
    let mut fmt = CsvFormatter::new(Vec::new());
    crate::format_si(si, &mut fmt)?;
    Ok(String::from_utf8(fmt.into_inner()).expect("formatter emits utf-8"))
}

/// Parses CSV into an array of objects; the first record carries the
/// column titles.
pub fn parse_csv(input: &str, delimiter: char) -> Result<SerializationInfo, SerError> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;
    let mut quoted_cell = false;
    let mut offset = 0usize;

    loop {
        let Some(ch) = chars.next() else { break };
        offset += ch.len_utf8();
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    offset += 1;
                    cell.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                cell.push(ch);
            }
            continue;
        }
        match ch {
            '"' if cell.is_empty() && !quoted_cell => {
                in_quotes = true;
                quoted_cell = true;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                    offset += 1;
                }
                record.push(std::mem::take(&mut cell));
                quoted_cell = false;
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut cell));
                quoted_cell = false;
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => {
                record.push(std::mem::take(&mut cell));
                quoted_cell = false;
            }
            c => cell.push(c),
        }
    }
    if in_quotes {
        return Err(SerError::parse("csv", offset, "unterminated quoted field"));
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell);
        records.push(record);
    }

    let mut result = SerializationInfo::array();
    let mut it = records.into_iter();
    let Some(titles) = it.next() else { return Ok(result) };
    for row in it {
        let mut obj = SerializationInfo::object();
        for (n, value) in row.into_iter().enumerate() {
            let name = titles.get(n).cloned().unwrap_or_else(|| n.to_string());
            obj.add_member(name).set_value(value).set_type_name("string");
        }
        result.push_member(obj);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SerializationInfo {
        let mut si = SerializationInfo::array();
        let mut row = SerializationInfo::object();
        row.add_member("a").set_value(1i64);
        row.add_member("b").set_value("x,y");
        si.push_member(row);
        let mut row = SerializationInfo::object();
        row.add_member("a").set_value(2i64);
        row.add_member("b").set_value("z");
        si.push_member(row);
        si
    }

    #[test]
    fn titles_and_quoting() {
        let csv = to_csv(&sample()).unwrap();
        assert_eq!(csv, "a,b\r\n1,\"x,y\"\r\n2,z\r\n");
    }

    #[test]
    fn roundtrip() {
        let si = sample();
        let csv = to_csv(&si).unwrap();
        let back = parse_csv(&csv, ',').unwrap();
        assert!(si.structurally_eq(&back), "{csv}\n{back:?}");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        let mut si = SerializationInfo::array();
        let mut row = SerializationInfo::object();
        row.add_member("q").set_value("say \"hi\"");
        si.push_member(row);
        let csv = to_csv(&si).unwrap();
        assert_eq!(csv, "q\r\n\"say \"\"hi\"\"\"\r\n");
        let back = parse_csv(&csv, ',').unwrap();
        assert_eq!(back.member_at(0).unwrap().member("q").unwrap().as_str(), "say \"hi\"");
    }

    #[test]
    fn embedded_newline_survives() {
        let mut si = SerializationInfo::array();
        let mut row = SerializationInfo::object();
        row.add_member("n").set_value("line1\nline2");
        si.push_member(row);
        let csv = to_csv(&si).unwrap();
        let back = parse_csv(&csv, ',').unwrap();
        assert_eq!(back.member_at(0).unwrap().member("n").unwrap().as_str(), "line1\nline2");
    }

    #[test]
    fn selected_columns_override_collection() {
        let mut fmt = CsvFormatter::new(Vec::new()).select_column("b").select_column("a");
        crate::format_si(&sample(), &mut fmt).unwrap();
        let csv = String::from_utf8(fmt.into_inner()).unwrap();
        assert_eq!(csv, "b,a\r\n\"x,y\",1\r\nz,2\r\n");
    }

    #[test]
    fn missing_member_leaves_empty_cell() {
        let mut si = SerializationInfo::array();
        let mut row = SerializationInfo::object();
        row.add_member("a").set_value(1i64);
        row.add_member("b").set_value("x");
        si.push_member(row);
        let mut row = SerializationInfo::object();
        row.add_member("a").set_value(2i64);
        si.push_member(row);
        let csv = to_csv(&si).unwrap();
        assert_eq!(csv, "a,b\r\n1,x\r\n2,\r\n");
    }

    #[test]
    fn scalar_array_is_one_column() {
        let mut si = SerializationInfo::array();
        si.push_member(SerializationInfo::value("p"));
        si.push_member(SerializationInfo::value("q"));
        let csv = to_csv(&si).unwrap();
        assert_eq!(csv, "p\r\nq\r\n");
    }

    #[test]
    fn lf_only_input_parses() {
        let back = parse_csv("a,b\n1,2\n", ',').unwrap();
        assert_eq!(back.member_at(0).unwrap().member("a").unwrap().as_str(), "1");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_csv("a\n\"oops", ',').is_err());
    }
}
