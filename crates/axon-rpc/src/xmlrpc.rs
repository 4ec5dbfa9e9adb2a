use axon_ser::{Category, SerializationInfo, parse_xml};

use crate::{RemoteError, Service, dispatch};

fn escape(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn value_xml(si: &SerializationInfo, out: &mut String) {
    out.push_str("<value>");
    match si.category() {
        Category::Array => {
            out.push_str("<array><data>");
            for member in si.members() {
                value_xml(member, out);
            }
            out.push_str("</data></array>");
        }
        Category::Object => {
            out.push_str("<struct>");
            for member in si.members() {
                out.push_str("<member><name>");
                escape(member.name(), out);
                out.push_str("</name>");
                value_xml(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        _ => match si.scalar() {
            axon_ser::ScalarValue::Int(v) => {
                out.push_str("<int>");
                out.push_str(&v.to_string());
                out.push_str("</int>");
            }
            axon_ser::ScalarValue::UInt(v) => {
                out.push_str("<int>");
                out.push_str(&v.to_string());
                out.push_str("</int>");
            }
            axon_ser::ScalarValue::Float(_) => {
                out.push_str("<double>");
                out.push_str(&si.as_str());
                out.push_str("</double>");
            }
            axon_ser::ScalarValue::Bool(v) => {
                out.push_str("<boolean>");
                out.push(if *v { '1' } else { '0' });
                out.push_str("</boolean>");
            }
            _ => {
                out.push_str("<string>");
                escape(&si.as_str(), out);
                out.push_str("</string>");
            }
        },
    }
    out.push_str("</value>");
}

/// Builds a `<methodCall>` document.
pub fn encode_method_call(method: &str, args: &[SerializationInfo]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    escape(method, &mut out);
    out.push_str("</methodName><params>");
    for arg in args {
        out.push_str("<param>");
        value_xml(arg, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Builds a `<methodResponse>` document, fault or result.
pub fn encode_method_response(outcome: &Result<SerializationInfo, RemoteError>) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse>");
    match outcome {
        Ok(result) => {
            out.push_str("<params><param>");
            value_xml(result, &mut out);
            out.push_str("</param></params>");
        }
        Err(error) => {
            let mut fault = SerializationInfo::object();
            fault.add_member("faultCode").set_value(i64::from(error.code));
            fault.add_member("faultString").set_value(error.message.as_str());
            out.push_str("<fault>");
            value_xml(&fault, &mut out);
            out.push_str("</fault>");
        }
    }
    out.push_str("</methodResponse>");
    out
}

/// Interprets a generically parsed `<value>` element.
fn value_from_xml(node: &SerializationInfo) -> Result<SerializationInfo, RemoteError> {
    if node.category() != Category::Object {
        // bare text inside <value> is a string
        return Ok(SerializationInfo::value(node.as_str()));
    }
    let inner = node
        .member_at(0)
        .ok_or_else(|| RemoteError::invalid_request("empty <value>"))?;
    match inner.name() {
        "int" | "i4" | "i8" => {
            let v = inner
                .as_i64()
                .map_err(|_| RemoteError::invalid_request("bad <int> content"))?;
            Ok(SerializationInfo::value(v))
        }
        "double" => {
            let v = inner
                .as_f64()
                .map_err(|_| RemoteError::invalid_request("bad <double> content"))?;
            Ok(SerializationInfo::value(v))
        }
        "boolean" => {
            let v = matches!(inner.as_str().as_str(), "1" | "true");
            Ok(SerializationInfo::value(v))
        }
        "string" => Ok(SerializationInfo::value(inner.as_str())),
        "nil" => Ok(SerializationInfo::new()),
        "array" => {
            let mut array = SerializationInfo::array();
            if let Some(data) = inner.member("data") {
                for child in data.members().iter().filter(|m| m.name() == "value") {
                    array.push_member(value_from_xml(child)?);
                }
            }
            Ok(array)
        }
        "struct" => {
            let mut object = SerializationInfo::object();
            for member in inner.members().iter().filter(|m| m.name() == "member") {
                let name = member
                    .member("name")
                    .map(|n| n.as_str())
                    .ok_or_else(|| RemoteError::invalid_request("<member> without <name>"))?;
                let value = member
                    .member("value")
                    .ok_or_else(|| RemoteError::invalid_request("<member> without <value>"))?;
                let mut value = value_from_xml(value)?;
                value.set_name(name);
                object.push_member(value);
            }
            Ok(object)
        }
        other => Err(RemoteError::invalid_request(format!("unknown value type <{other}>"))),
    }
}

/// Decodes a `<methodCall>` body.
pub fn decode_method_call(
    body: &[u8],
) -> Result<(String, Vec<SerializationInfo>), RemoteError> {
    let text =
        std::str::from_utf8(body).map_err(|_| RemoteError::parse_error("body is not utf-8"))?;
    let doc = parse_xml(text).map_err(|e| RemoteError::parse_error(e.to_string()))?;
    if doc.name() != "methodCall" {
        return Err(RemoteError::invalid_request("expected <methodCall>"));
    }
    let method = doc
        .member("methodName")
        .map(|m| m.as_str())
        .ok_or_else(|| RemoteError::invalid_request("missing <methodName>"))?;
    let mut args = Vec::new();
    if let Some(params) = doc.member("params") {
        for param in params.members().iter().filter(|m| m.name() == "param") {
            let value = param
                .member("value")
                .ok_or_else(|| RemoteError::invalid_request("<param> without <value>"))?;
            args.push(value_from_xml(value)?);
        }
    }
    Ok((method, args))
}

/// Decodes a `<methodResponse>` body into the call outcome.
pub fn decode_method_response(body: &[u8]) -> Result<SerializationInfo, RemoteError> {
    let text =
        std::str::from_utf8(body).map_err(|_| RemoteError::parse_error("body is not utf-8"))?;
    let doc = parse_xml(text).map_err(|e| RemoteError::parse_error(e.to_string()))?;
    if doc.name() != "methodResponse" {
        return Err(RemoteError::parse_error("expected <methodResponse>"));
    }
    if let Some(fault) = doc.member("fault") {
        let value = fault
            .member("value")
            .ok_or_else(|| RemoteError::parse_error("<fault> without <value>"))?;
        let detail = value_from_xml(value)?;
        let code = detail.member("faultCode").and_then(|c| c.as_i64().ok()).unwrap_or(0);
        let message = detail
            .member("faultString")
            .map(|m| m.as_str())
            .unwrap_or_else(|| "unknown fault".to_string());
        return Err(RemoteError::remote(code as i32, message));
    }
    let value = doc
        .member("params")
        .and_then(|p| p.member("param"))
        .and_then(|p| p.member("value"))
        .ok_or_else(|| RemoteError::parse_error("response carries no value"))?;
    value_from_xml(value)
}

/// Serves one request body; always returns a response body.
pub(crate) fn serve_body(service: &Service, body: &[u8]) -> String {
    let outcome = decode_method_call(body)
        .and_then(|(method, args)| dispatch(service, &method, &args));
    encode_method_response(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_ser::to_si;

    #[test]
    fn method_call_shape() {
        let body = encode_method_call("echo", &[to_si("hello")]);
        assert_eq!(
            body,
            "<?xml version=\"1.0\"?><methodCall><methodName>echo</methodName>\
<params><param><value><string>hello</string></value></param></params></methodCall>"
        );
    }

    #[test]
    fn call_roundtrip() {
        let args = [to_si(&5i64), to_si("x<y"), to_si(&true)];
        let body = encode_method_call("mix", &args);
        let (method, parsed) = decode_method_call(body.as_bytes()).unwrap();
        assert_eq!(method, "mix");
        assert_eq!(parsed[0].as_i64().unwrap(), 5);
        assert_eq!(parsed[1].as_str(), "x<y");
        assert!(parsed[2].as_bool().unwrap());
    }

    #[test]
    fn nested_values_roundtrip() {
        let mut obj = SerializationInfo::object();
        obj.add_member("name").set_value("deep");
        let arr = obj.add_member("values");
        arr.set_category(Category::Array);
        arr.push_member(to_si(&1i64));
        arr.push_member(to_si(&2i64));

        let body = encode_method_call("put", &[obj.clone()]);
        let (_, parsed) = decode_method_call(body.as_bytes()).unwrap();
        assert!(obj.structurally_eq(&parsed[0]), "{body}");
    }

    #[test]
    fn response_roundtrip() {
        let body = encode_method_response(&Ok(to_si(&11i64)));
        assert_eq!(decode_method_response(body.as_bytes()).unwrap().as_i64().unwrap(), 11);
    }

    #[test]
    fn fault_roundtrip() {
        let body =
            encode_method_response(&Err(RemoteError::remote(3, "broken")));
        assert!(body.contains("faultCode"));
        let err = decode_method_response(body.as_bytes()).unwrap_err();
        assert_eq!(err.code, 3);
        assert_eq!(err.message, "broken");
    }

    #[test]
    fn serve_dispatches() {
        let mut service = Service::new();
        service.register_fn2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
        let reply = serve_body(&service, encode_method_call("add", &[to_si(&5i64), to_si(&6i64)]).as_bytes());
        assert_eq!(decode_method_response(reply.as_bytes()).unwrap().as_i64().unwrap(), 11);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = decode_method_call(b"not xml at all").unwrap_err();
        assert_eq!(err.code, crate::PARSE_ERROR);
    }
}
