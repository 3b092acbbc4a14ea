//! RFC over SOAP: calling function modules through the `/sap/bc/soap/rfc`
//! ICF service of the application server.
//!
//! The service maps every remote-enabled function module to a SOAP operation
//! named after it. Scalars become elements, tables become lists of `item`
//! elements and ABAP exceptions come back as SOAP faults.

use crate::{
    error::SxpgError,
    rfc::{self, RfcRecord, RfcSession},
    target::Target,
};
use reqwest::{
    blocking::Client,
    header::CONTENT_TYPE,
    StatusCode,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

const SOAP_PATH: &str = "/sap/bc/soap/rfc";
const SOAP_ACTION: &str = "urn:sap-com:document:sap:rfc:functions";
/// Trivial function module used to check the logon

/// Where the SOAP service listens
#[derive(Clone, Debug, Default)]
pub struct SoapEndpoint {
    /// Use HTTPS instead of HTTP
    pub https: bool,
    /// ICM port. Derived from the system number when absent (`80NN` / `443NN`).
    pub port: Option<u16>,
    /// Accept certificates that do not validate
    pub insecure: bool,
}

impl SoapEndpoint {
    /// Full service URL for a target
    pub fn url(&self, target: &Target) -> String {
        let sysnr = target.sysnr().unwrap_or("00");
        let (scheme, port) = if self.https {
            ("https", self.port.map(|p| p.to_string()).unwrap_or_else(|| format!("443{sysnr}")))
        } else {
            ("http", self.port.map(|p| p.to_string()).unwrap_or_else(|| format!("80{sysnr}")))
        };
        format!(
            "{scheme}://{}:{port}{SOAP_PATH}?sap-client={}&sap-language={}",
            target.host, target.client, target.language
        )
    }
}

/// A logged on session talking to the SOAP RFC service
pub struct SoapSession {
    target: Target,
    url: String,
    client: Client,
}

impl SoapSession {
    /// Build the HTTP client and verify the logon with `RFC_PING`
    pub fn connect(target: Target, endpoint: &SoapEndpoint) -> Result<Self, SxpgError> {
        let url = endpoint.url(&target);
        let client = Client::builder()
            .timeout(target.timeout)
            .danger_accept_invalid_certs(endpoint.insecure)
            .build()
            .map_err(|e| SxpgError::Connection {
                target: target.to_string(),
                message: format!("building HTTP client: {e}"),
            })?;
        let session = Self { target, url, client };
        session.call(rfc::PING, &RfcRecord::new())?;
        info!(system = %session.target, url = %session.url, "SAP connection established");
        Ok(session)
    }

    fn post(&self, function: &str, body: String) -> Result<(StatusCode, String), SxpgError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(
                &self.target.credentials.user,
                Some(self.target.credentials.password.expose()),
            )
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(body)
            .send()
            .map_err(|e| self.transport_error(function, e))?;
        let status = response.status();
        let text = response.text().map_err(|e| self.transport_error(function, e))?;
        Ok((status, text))
    }

    fn transport_error(&self, function: &str, e: reqwest::Error) -> SxpgError {
        if e.is_timeout() {
            SxpgError::Timeout {
                target: self.target.to_string(),
                function: function.to_string(),
                after: self.target.timeout,
            }
        } else {
            SxpgError::Connection {
                target: self.target.to_string(),
                message: e.without_url().to_string(),
            }
        }
    }
}

impl RfcSession for SoapSession {
    fn target(&self) -> &Target {
        &self.target
    }

    fn call(&self, function: &str, params: &RfcRecord) -> Result<RfcRecord, SxpgError> {
        debug!(function, fields = params.len(), "calling function module");
        let (status, body) = self.post(function, envelope(function, params))?;
        match status {
            StatusCode::UNAUTHORIZED => {
                return Err(SxpgError::Connection {
                    target: self.target.to_string(),
                    message: "logon rejected (HTTP 401)".to_string(),
                })
            }
            StatusCode::FORBIDDEN => {
                return Err(SxpgError::Authorization {
                    target: self.target.to_string(),
                    function: function.to_string(),
                    message: "HTTP 403".to_string(),
                })
            }
            StatusCode::NOT_FOUND => {
                return Err(SxpgError::Connection {
                    target: self.target.to_string(),
                    message: format!("SOAP RFC service not active at {SOAP_PATH} (HTTP 404)"),
                })
            }
            _ => {}
        }
        let document = parse(&body).map_err(|message| {
            if status.is_success() {
                SxpgError::MalformedResponse {
                    function: function.to_string(),
                    message,
                }
            } else {
                SxpgError::Connection {
                    target: self.target.to_string(),
                    message: format!("HTTP {status}"),
                }
            }
        })?;
        decode_response(&self.target, function, &document)
    }

    fn close(&mut self) {
        // Every SOAP call is its own logon; nothing stays open on the server.
        debug!(system = %self.target, "dropping HTTP client");
    }
}

/// SOAP element name of a function module. Namespace slashes are written as `_-`.
fn operation_name(function: &str) -> String {
    function.replace('/', "_-")
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_field(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) if s.is_empty() => out.push_str(&format!("<{name}/>")),
        Value::String(s) => out.push_str(&format!("<{name}>{}</{name}>", escape(s))),
        Value::Array(rows) if rows.is_empty() => out.push_str(&format!("<{name}/>")),
        Value::Array(rows) => {
            out.push_str(&format!("<{name}>"));
            for row in rows {
                write_field(out, "item", row);
            }
            out.push_str(&format!("</{name}>"));
        }
        Value::Object(fields) => {
            out.push_str(&format!("<{name}>"));
            for (field, value) in fields {
                write_field(out, field, value);
            }
            out.push_str(&format!("</{name}>"));
        }
        other => out.push_str(&format!("<{name}>{other}</{name}>")),
    }
}

/// Request document for one call
fn envelope(function: &str, params: &RfcRecord) -> String {
    let operation = operation_name(function);
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <SOAP-ENV:Envelope xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\">\
         <SOAP-ENV:Body>",
    );
    out.push_str(&format!("<urn:{operation} xmlns:urn=\"{SOAP_ACTION}\">"));
    for (name, value) in params {
        write_field(&mut out, name, value);
    }
    out.push_str(&format!("</urn:{operation}>"));
    out.push_str("</SOAP-ENV:Body></SOAP-ENV:Envelope>");
    out
}

/// Element of a parsed response, namespace prefixes stripped
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Scalars become strings, lists of `item` become tables, anything else a structure
    fn to_value(&self) -> Value {
        if self.children.is_empty() {
            Value::String(self.text.clone())
        } else if self.children.iter().all(|c| c.name == "item") {
            Value::Array(self.children.iter().map(Element::to_value).collect())
        } else {
            Value::Object(
                self.children
                    .iter()
                    .map(|c| (c.name.clone(), c.to_value()))
                    .collect::<Map<_, _>>(),
            )
        }
    }
}

fn decode_response(target: &Target, function: &str, document: &Element) -> Result<RfcRecord, SxpgError> {
    let body = document
        .child("Body")
        .ok_or_else(|| SxpgError::MalformedResponse {
            function: function.to_string(),
            message: "no SOAP body".to_string(),
        })?;
    let payload = body.children.first().ok_or_else(|| SxpgError::MalformedResponse {
        function: function.to_string(),
        message: "empty SOAP body".to_string(),
    })?;

    if payload.name == "Fault" {
        return Err(decode_fault(target, function, payload));
    }

    Ok(payload
        .children
        .iter()
        .map(|c| (c.name.clone(), c.to_value()))
        .collect())
}

fn decode_fault(target: &Target, function: &str, fault: &Element) -> SxpgError {
    let faultstring = fault.child("faultstring").map(|e| e.text.trim().to_string()).unwrap_or_default();
    let exception = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .and_then(|e| e.child("Name"))
        .map(|e| e.text.trim().to_string())
        .filter(|name| !name.is_empty());
    let text = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .and_then(|e| e.child("Text"))
        .map(|e| e.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| faultstring.clone());

    match exception {
        Some(exception) => SxpgError::RemoteException {
            function: function.to_string(),
            exception,
            message: text,
        },
        None if faultstring.to_lowercase().contains("authoriz") => SxpgError::Authorization {
            target: target.to_string(),
            function: function.to_string(),
            message: faultstring,
        },
        None => SxpgError::RemoteException {
            function: function.to_string(),
            exception: "SYSTEM_FAILURE".to_string(),
            message: faultstring,
        },
    }
}

/// Just enough XML to read SOAP responses: elements, text, CDATA and the
/// predefined and numeric entities. Attributes are skipped.
fn parse(input: &str) -> Result<Element, String> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_misc();
    let root = parser.element()?;
    Ok(root)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_until(&mut self, end: &str) -> Result<&'a str, String> {
        let rest = self.rest();
        let idx = rest.find(end).ok_or_else(|| format!("unterminated construct, expected {end}"))?;
        self.pos += idx + end.len();
        Ok(&rest[..idx])
    }

    /// Whitespace, the XML declaration, processing instructions and comments
    fn skip_misc(&mut self) {
        loop {
            let trimmed = self.rest().trim_start();
            self.pos = self.input.len() - trimmed.len();
            if trimmed.starts_with("<?") {
                if self.skip_until("?>").is_err() {
                    return;
                }
            } else if trimmed.starts_with("<!--") {
                if self.skip_until("-->").is_err() {
                    return;
                }
            } else {
                return;
            }
        }
    }

    fn element(&mut self) -> Result<Element, String> {
        if !self.rest().starts_with('<') {
            return Err(format!("expected element at offset {}", self.pos));
        }
        self.pos += 1;
        let rest = self.rest();
        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .ok_or("unterminated tag")?;
        let qualified = &rest[..name_len];
        let name = local_name(qualified).to_string();
        self.pos += name_len;

        // Attributes, quoted values may contain '>'
        let mut quote = None;
        let mut empty = false;
        loop {
            let c = self.rest().chars().next().ok_or("unterminated tag")?;
            self.pos += c.len_utf8();
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(c),
                (None, '/') if self.rest().starts_with('>') => {
                    self.pos += 1;
                    empty = true;
                    break;
                }
                (None, '>') => break,
                _ => {}
            }
        }

        let mut element = Element { name, ..Default::default() };
        if empty {
            return Ok(element);
        }

        loop {
            let rest = self.rest();
            let text_len = rest.find('<').ok_or_else(|| format!("unclosed element {qualified}"))?;
            element.text.push_str(&unescape(&rest[..text_len]));
            self.pos += text_len;

            let rest = self.rest();
            if rest.starts_with("</") {
                self.pos += 2;
                let closing = self.skip_until(">")?.trim();
                if local_name(closing) != element.name {
                    return Err(format!("mismatched </{closing}> for <{qualified}>"));
                }
                return Ok(element);
            } else if rest.starts_with("<!--") {
                self.skip_until("-->")?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let data = self.skip_until("]]>")?;
                element.text.push_str(data);
            } else if rest.starts_with("<?") {
                self.skip_until("?>")?;
            } else {
                element.children.push(self.element()?);
            }
        }
    }
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
            }
            _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
