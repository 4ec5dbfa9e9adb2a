use crate::{Category, ScalarValue, SerError, SerializationInfo};

/// The sink every codec implements.
///
/// A decomposer walks a tree and emits this call sequence; a parser
/// consumes a byte stream and emits the same sequence into a builder.
pub trait Formatter {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        id: &str,
    ) -> Result<(), SerError>;

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError>;

    fn begin_object(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError>;

    fn begin_member(&mut self, name: &str) -> Result<(), SerError>;

    fn finish_member(&mut self) -> Result<(), SerError>;

    fn finish_object(&mut self) -> Result<(), SerError>;

    fn begin_array(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError>;

    fn finish_array(&mut self) -> Result<(), SerError>;

    fn finish(&mut self) -> Result<(), SerError>;
}

fn walk(si: &SerializationInfo, formatter: &mut dyn Formatter) -> Result<(), SerError> {
    match si.category() {
        Category::Void | Category::Value => {
            formatter.add_value(si.name(), si.type_name(), si.scalar(), si.id())
        }
        Category::Reference => formatter.add_reference(si.name(), &si.as_str()),
        Category::Object => {
            formatter.begin_object(si.name(), si.type_name(), si.id())?;
            for member in si.members() {
                formatter.begin_member(member.name())?;
                walk(member, formatter)?;
                formatter.finish_member()?;
            }
            formatter.finish_object()
        }
        Category::Array => {
            formatter.begin_array(si.name(), si.type_name(), si.id())?;
            for member in si.members() {
                walk(member, formatter)?;
            }
            formatter.finish_array()
        }
    }
}

/// Feeds the whole tree into `formatter`, including the final `finish`.
pub fn format_si(si: &SerializationInfo, formatter: &mut dyn Formatter) -> Result<(), SerError> {
    walk(si, formatter)?;
    formatter.finish()
}

/// A [`Formatter`] that rebuilds the SI tree from the event sequence.
///
/// Member markers carry no information beyond what the node events
/// already hold, so they are ignored here.
#[derive(Default)]
pub struct SiBuilder {
    stack: Vec<SerializationInfo>,
    root: Option<SerializationInfo>,
}

impl SiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&mut self, si: SerializationInfo) {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.push_member(si);
            }
            None => self.root = Some(si),
        }
    }

    /// The finished tree; fails when the event sequence was incomplete.
    pub fn take(&mut self) -> Result<SerializationInfo, SerError> {
        if !self.stack.is_empty() {
            return Err(SerError::UnexpectedEnd("builder"));
        }
        self.root.take().ok_or(SerError::UnexpectedEnd("builder"))
    }
}

impl Formatter for SiBuilder {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        id: &str,
    ) -> Result<(), SerError> {
        let mut si = SerializationInfo::new();
        si.set_category(Category::Value)
            .set_name(name)
            .set_type_name(type_name)
            .set_id(id)
            .set_value(value.clone());
        self.attach(si);
        Ok(())
    }

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError> {
        let si = SerializationInfo::reference(target).with_name(name);
        self.attach(si);
        Ok(())
    }

    fn begin_object(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        let mut si = SerializationInfo::object();
        si.set_name(name).set_type_name(type_name).set_id(id);
        self.stack.push(si);
        Ok(())
    }

    fn begin_member(&mut self, _name: &str) -> Result<(), SerError> {
        Ok(())
    }

    fn finish_member(&mut self) -> Result<(), SerError> {
        Ok(())
    }

    fn finish_object(&mut self) -> Result<(), SerError> {
        let si = self.stack.pop().ok_or(SerError::UnexpectedEnd("builder"))?;
        self.attach(si);
        Ok(())
    }

    fn begin_array(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        let mut si = SerializationInfo::array();
        si.set_name(name).set_type_name(type_name).set_id(id);
        self.stack.push(si);
        Ok(())
    }

    fn finish_array(&mut self) -> Result<(), SerError> {
        self.finish_object()
    }

    fn finish(&mut self) -> Result<(), SerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rebuilds_what_the_walker_emits() {
        let mut si = SerializationInfo::object();
        si.add_member("a").set_value(1i64);
        let arr = si.add_member("list");
        arr.set_category(Category::Array);
        arr.push_member(SerializationInfo::value("x"));
        arr.push_member(SerializationInfo::value("y"));
        si.add_member("ref").set_category(Category::Reference).set_value("1");

        let mut builder = SiBuilder::new();
        format_si(&si, &mut builder).unwrap();
        let rebuilt = builder.take().unwrap();
        assert!(si.structurally_eq(&rebuilt));
    }

    #[test]
    fn builder_detects_unbalanced_input() {
        let mut builder = SiBuilder::new();
        builder.begin_object("", "", "").unwrap();
        assert!(builder.take().is_err());
    }
}
