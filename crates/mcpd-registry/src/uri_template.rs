//! RFC 6570 URI templates, levels 1-4.
//!
//! Templates are parsed into literal/expression components at
//! construction time; [`UriTemplate::resolve`] expands each expression
//! per its operator, honoring prefix (`:N`) and explode (`*`) modifiers
//! and the RFC's rules for undefined, null, and empty values.
//!
//! Used to turn a resource-template capability into a concrete server
//! URI given caller-supplied variables.

use std::collections::HashMap;
use std::fmt::Write as _;

use thiserror::Error;

/// Template parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriTemplateError {
    #[error("unterminated expression at offset {0}")]
    Unterminated(usize),

    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(char),

    #[error("invalid variable specification '{0}'")]
    InvalidVarSpec(String),

    #[error("prefix length out of range in '{0}'")]
    PrefixOutOfRange(String),
}

/// A value supplied for template expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValue {
    /// Simple string value.
    Text(String),
    /// Ordered list.
    List(Vec<String>),
    /// Associative array (ordered key/value pairs).
    Assoc(Vec<(String, String)>),
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for TemplateValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<(String, String)>> for TemplateValue {
    fn from(value: Vec<(String, String)>) -> Self {
        Self::Assoc(value)
    }
}

impl TemplateValue {
    /// RFC 6570 treats empty lists and empty associative arrays as
    /// undefined; the empty string is defined.
    fn is_defined(&self) -> bool {
        match self {
            Self::Text(_) => true,
            Self::List(items) => !items.is_empty(),
            Self::Assoc(pairs) => !pairs.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `{var}`
    Simple,
    /// `{+var}`
    Reserved,
    /// `{#var}`
    Fragment,
    /// `{.var}`
    Label,
    /// `{/var}`
    Path,
    /// `{;var}`
    PathParam,
    /// `{?var}`
    Query,
    /// `{&var}`
    QueryContinuation,
}

impl Operator {
    fn first(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved => "",
            Self::Fragment => "#",
            Self::Label => ".",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query => "?",
            Self::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved | Self::Fragment => ",",
            Self::Label => ".",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query | Self::QueryContinuation => "&",
        }
    }

    /// Named operators emit `name=value` pairs.
    fn named(self) -> bool {
        matches!(self, Self::PathParam | Self::Query | Self::QueryContinuation)
    }

    /// What an empty value expands to after the name.
    fn if_empty(self) -> &'static str {
        match self {
            Self::Query | Self::QueryContinuation => "=",
            _ => "",
        }
    }

    /// Reserved-set characters (and pct-triplets) pass through unencoded.
    fn allow_reserved(self) -> bool {
        matches!(self, Self::Reserved | Self::Fragment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    None,
    /// `:N` - at most N leading characters of a string value.
    Prefix(usize),
    /// `*` - expand composite values element-wise.
    Explode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: String,
    modifier: Modifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Literal(String),
    Expression {
        operator: Operator,
        variables: Vec<VarSpec>,
    },
}

/// A parsed RFC 6570 URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    components: Vec<Component>,
}

impl UriTemplate {
    /// Parse a template string.
    pub fn parse(template: &str) -> Result<Self, UriTemplateError> {
        let mut components = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((offset, ch)) = chars.next() {
            if ch != '{' {
                literal.push(ch);
                continue;
            }

            if !literal.is_empty() {
                components.push(Component::Literal(std::mem::take(&mut literal)));
            }

            let mut expression = String::new();
            let mut closed = false;
            for (_, inner) in chars.by_ref() {
                if inner == '}' {
                    closed = true;
                    break;
                }
                expression.push(inner);
            }
            if !closed {
                return Err(UriTemplateError::Unterminated(offset));
            }

            components.push(Self::parse_expression(&expression)?);
        }

        if !literal.is_empty() {
            components.push(Component::Literal(literal));
        }

        Ok(Self { components })
    }

    fn parse_expression(expression: &str) -> Result<Component, UriTemplateError> {
        let mut rest = expression;
        let operator = match rest.chars().next() {
            Some('+') => Some(Operator::Reserved),
            Some('#') => Some(Operator::Fragment),
            Some('.') => Some(Operator::Label),
            Some('/') => Some(Operator::Path),
            Some(';') => Some(Operator::PathParam),
            Some('?') => Some(Operator::Query),
            Some('&') => Some(Operator::QueryContinuation),
            // Reserved for future RFC extensions
            Some(op @ ('=' | ',' | '!' | '@' | '|')) => {
                return Err(UriTemplateError::UnsupportedOperator(op));
            }
            _ => None,
        };
        let operator = if let Some(op) = operator {
            rest = &rest[1..];
            op
        } else {
            Operator::Simple
        };

        let mut variables = Vec::new();
        for spec in rest.split(',') {
            variables.push(Self::parse_varspec(spec)?);
        }
        if variables.is_empty() {
            return Err(UriTemplateError::InvalidVarSpec(expression.to_string()));
        }

        Ok(Component::Expression {
            operator,
            variables,
        })
    }

    fn parse_varspec(spec: &str) -> Result<VarSpec, UriTemplateError> {
        let (name, modifier) = if let Some(stripped) = spec.strip_suffix('*') {
            (stripped, Modifier::Explode)
        } else if let Some((name, digits)) = spec.split_once(':') {
            let length: usize = digits
                .parse()
                .map_err(|_| UriTemplateError::InvalidVarSpec(spec.to_string()))?;
            if length == 0 || length >= 10_000 {
                return Err(UriTemplateError::PrefixOutOfRange(spec.to_string()));
            }
            (name, Modifier::Prefix(length))
        } else {
            (spec, Modifier::None)
        };

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '%'))
        {
            return Err(UriTemplateError::InvalidVarSpec(spec.to_string()));
        }

        Ok(VarSpec {
            name: name.to_string(),
            modifier,
        })
    }

    /// Expand the template with the given variables.
    ///
    /// Undefined variables (missing keys, empty lists/assocs) are skipped
    /// per the RFC; this cannot fail at expansion time.
    pub fn resolve(&self, vars: &HashMap<String, TemplateValue>) -> String {
        let mut out = String::new();
        for component in &self.components {
            match component {
                Component::Literal(text) => out.push_str(text),
                Component::Expression {
                    operator,
                    variables,
                } => Self::expand_expression(&mut out, *operator, variables, vars),
            }
        }
        out
    }

    /// Variable names referenced by the template, in order of appearance.
    pub fn variable_names(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter_map(|c| match c {
                Component::Expression { variables, .. } => {
                    Some(variables.iter().map(|v| v.name.as_str()))
                }
                Component::Literal(_) => None,
            })
            .flatten()
            .collect()
    }

    fn expand_expression(
        out: &mut String,
        operator: Operator,
        variables: &[VarSpec],
        vars: &HashMap<String, TemplateValue>,
    ) {
        let mut first = true;
        for spec in variables {
            let Some(value) = vars.get(&spec.name).filter(|v| v.is_defined()) else {
                continue;
            };

            let mut part = String::new();
            Self::expand_value(&mut part, operator, spec, value);

            if first {
                out.push_str(operator.first());
                first = false;
            } else {
                out.push_str(operator.separator());
            }
            out.push_str(&part);
        }
    }

    fn expand_value(out: &mut String, operator: Operator, spec: &VarSpec, value: &TemplateValue) {
        let allow = operator.allow_reserved();
        match (value, spec.modifier) {
            (TemplateValue::Text(text), modifier) => {
                let text = if let Modifier::Prefix(max) = modifier {
                    let end = text
                        .char_indices()
                        .map(|(i, _)| i)
                        .nth(max)
                        .unwrap_or(text.len());
                    &text[..end]
                } else {
                    text.as_str()
                };
                if operator.named() {
                    out.push_str(&spec.name);
                    if text.is_empty() {
                        out.push_str(operator.if_empty());
                        return;
                    }
                    out.push('=');
                }
                encode(out, text, allow);
            }
            (TemplateValue::List(items), Modifier::Explode) => {
                let mut sep = false;
                for item in items {
                    if sep {
                        out.push_str(operator.separator());
                    }
                    sep = true;
                    if operator.named() {
                        out.push_str(&spec.name);
                        if item.is_empty() {
                            out.push_str(operator.if_empty());
                            continue;
                        }
                        out.push('=');
                    }
                    encode(out, item, allow);
                }
            }
            (TemplateValue::List(items), _) => {
                if operator.named() {
                    out.push_str(&spec.name);
                    out.push('=');
                }
                let mut sep = false;
                for item in items {
                    if sep {
                        out.push(',');
                    }
                    sep = true;
                    encode(out, item, allow);
                }
            }
            (TemplateValue::Assoc(pairs), Modifier::Explode) => {
                let mut sep = false;
                for (key, item) in pairs {
                    if sep {
                        out.push_str(operator.separator());
                    }
                    sep = true;
                    encode(out, key, allow);
                    out.push('=');
                    encode(out, item, allow);
                }
            }
            (TemplateValue::Assoc(pairs), _) => {
                if operator.named() {
                    out.push_str(&spec.name);
                    out.push('=');
                }
                let mut sep = false;
                for (key, item) in pairs {
                    if sep {
                        out.push(',');
                    }
                    sep = true;
                    encode(out, key, allow);
                    out.push(',');
                    encode(out, item, allow);
                }
            }
        }
    }
}

const fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

const fn is_reserved(c: char) -> bool {
    matches!(
        c,
        ':' | '/'
            | '?'
            | '#'
            | '['
            | ']'
            | '@'
            | '!'
            | '$'
            | '&'
            | '\''
            | '('
            | ')'
            | '*'
            | '+'
            | ','
            | ';'
            | '='
    )
}

/// Percent-encode `text` into `out`. With `allow_reserved`, reserved
/// characters and well-formed pct-triplets pass through untouched.
fn encode(out: &mut String, text: &str, allow_reserved: bool) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < text.len() {
        let ch = text[i..].chars().next().unwrap_or('\0');

        if allow_reserved
            && ch == '%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push_str(&text[i..i + 3]);
            i += 3;
            continue;
        }

        if is_unreserved(ch) || (allow_reserved && is_reserved(ch)) {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).as_bytes() {
                let _ = write!(out, "%{byte:02X}");
            }
        }
        i += ch.len_utf8();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(template: &str, vars: &HashMap<String, TemplateValue>) -> String {
        UriTemplate::parse(template).unwrap().resolve(vars)
    }

    /// The standard variable set used by the RFC 6570 examples.
    fn rfc_vars() -> HashMap<String, TemplateValue> {
        let mut vars = HashMap::new();
        vars.insert("var".to_string(), "value".into());
        vars.insert("hello".to_string(), "Hello World!".into());
        vars.insert("half".to_string(), "50%".into());
        vars.insert("who".to_string(), "fred".into());
        vars.insert("base".to_string(), "http://example.com/home/".into());
        vars.insert("path".to_string(), "/foo/bar".into());
        vars.insert("empty".to_string(), "".into());
        vars.insert("x".to_string(), "1024".into());
        vars.insert("y".to_string(), "768".into());
        vars.insert(
            "list".to_string(),
            vec!["red".to_string(), "green".to_string(), "blue".to_string()].into(),
        );
        vars.insert(
            "keys".to_string(),
            vec![
                ("semi".to_string(), ";".to_string()),
                ("dot".to_string(), ".".to_string()),
                ("comma".to_string(), ",".to_string()),
            ]
            .into(),
        );
        vars.insert("v".to_string(), "6".into());
        vars.insert("dub".to_string(), "me/too".into());
        vars
    }

    #[test]
    fn test_level_1_simple_expansion() {
        let vars = rfc_vars();
        assert_eq!(resolve("{var}", &vars), "value");
        assert_eq!(resolve("{hello}", &vars), "Hello%20World%21");
        assert_eq!(resolve("O{empty}X", &vars), "OX");
        assert_eq!(resolve("O{undef}X", &vars), "OX");
    }

    #[test]
    fn test_level_2_reserved_and_fragment() {
        let vars = rfc_vars();
        assert_eq!(resolve("{+var}", &vars), "value");
        assert_eq!(resolve("{+hello}", &vars), "Hello%20World!");
        assert_eq!(resolve("{+path}/here", &vars), "/foo/bar/here");
        assert_eq!(resolve("{+half}", &vars), "50%25");
        assert_eq!(
            resolve("{+base}index", &vars),
            "http://example.com/home/index"
        );
        assert_eq!(resolve("X{#var}", &vars), "X#value");
        assert_eq!(resolve("X{#hello}", &vars), "X#Hello%20World!");
    }

    #[test]
    fn test_level_3_multiple_variables() {
        let vars = rfc_vars();
        assert_eq!(resolve("map?{x,y}", &vars), "map?1024,768");
        assert_eq!(resolve("{x,hello,y}", &vars), "1024,Hello%20World%21,768");
        assert_eq!(resolve("{+x,hello,y}", &vars), "1024,Hello%20World!,768");
        assert_eq!(resolve("{#x,hello,y}", &vars), "#1024,Hello%20World!,768");
    }

    #[test]
    fn test_level_3_label_and_path() {
        let vars = rfc_vars();
        assert_eq!(resolve("X{.var}", &vars), "X.value");
        assert_eq!(resolve("X{.x,y}", &vars), "X.1024.768");
        assert_eq!(resolve("{/var}", &vars), "/value");
        assert_eq!(resolve("{/var,x}/here", &vars), "/value/1024/here");
    }

    #[test]
    fn test_level_3_form_style() {
        let vars = rfc_vars();
        assert_eq!(resolve("{;x,y}", &vars), ";x=1024;y=768");
        assert_eq!(resolve("{;x,y,empty}", &vars), ";x=1024;y=768;empty");
        assert_eq!(resolve("{?x,y}", &vars), "?x=1024&y=768");
        assert_eq!(resolve("{?x,y,empty}", &vars), "?x=1024&y=768&empty=");
        assert_eq!(resolve("?fixed=yes{&x}", &vars), "?fixed=yes&x=1024");
        assert_eq!(resolve("{&x,y,empty}", &vars), "&x=1024&y=768&empty=");
    }

    #[test]
    fn test_level_4_prefix() {
        let vars = rfc_vars();
        assert_eq!(resolve("{var:3}", &vars), "val");
        assert_eq!(resolve("{var:30}", &vars), "value");
        assert_eq!(resolve("{+path:6}/here", &vars), "/foo/b/here");
        assert_eq!(resolve("X{.var:3}", &vars), "X.val");
        assert_eq!(resolve("{/var:1,var}", &vars), "/v/value");
        assert_eq!(resolve("{;hello:5}", &vars), ";hello=Hello");
        assert_eq!(resolve("{?var:3}", &vars), "?var=val");
        assert_eq!(resolve("{&var:3}", &vars), "&var=val");
    }

    #[test]
    fn test_level_4_list_explode() {
        let vars = rfc_vars();
        assert_eq!(resolve("{list}", &vars), "red,green,blue");
        assert_eq!(resolve("{list*}", &vars), "red,green,blue");
        assert_eq!(resolve("{+list}", &vars), "red,green,blue");
        assert_eq!(resolve("{#list}", &vars), "#red,green,blue");
        assert_eq!(resolve("X{.list}", &vars), "X.red,green,blue");
        assert_eq!(resolve("X{.list*}", &vars), "X.red.green.blue");
        assert_eq!(resolve("{/list}", &vars), "/red,green,blue");
        assert_eq!(resolve("{/list*}", &vars), "/red/green/blue");
        assert_eq!(resolve("{/list*,path:4}", &vars), "/red/green/blue/%2Ffoo");
        assert_eq!(resolve("{;list}", &vars), ";list=red,green,blue");
        assert_eq!(resolve("{;list*}", &vars), ";list=red;list=green;list=blue");
        assert_eq!(resolve("{?list}", &vars), "?list=red,green,blue");
        assert_eq!(resolve("{?list*}", &vars), "?list=red&list=green&list=blue");
        assert_eq!(resolve("{&list*}", &vars), "&list=red&list=green&list=blue");
    }

    #[test]
    fn test_level_4_assoc_explode() {
        let vars = rfc_vars();
        assert_eq!(resolve("{keys}", &vars), "semi,%3B,dot,.,comma,%2C");
        assert_eq!(resolve("{keys*}", &vars), "semi=%3B,dot=.,comma=%2C");
        assert_eq!(resolve("{+keys}", &vars), "semi,;,dot,.,comma,,");
        assert_eq!(resolve("{#keys}", &vars), "#semi,;,dot,.,comma,,");
        assert_eq!(resolve("{/keys}", &vars), "/semi,%3B,dot,.,comma,%2C");
        assert_eq!(resolve("{/keys*}", &vars), "/semi=%3B/dot=./comma=%2C");
        assert_eq!(resolve("{;keys*}", &vars), ";semi=%3B;dot=.;comma=%2C");
        assert_eq!(resolve("{?keys*}", &vars), "?semi=%3B&dot=.&comma=%2C");
        assert_eq!(resolve("{&keys*}", &vars), "&semi=%3B&dot=.&comma=%2C");
    }

    #[test]
    fn test_undefined_composites_are_skipped() {
        let mut vars = rfc_vars();
        vars.insert("list".to_string(), TemplateValue::List(vec![]));
        assert_eq!(resolve("X{?list}", &vars), "X");
        assert_eq!(resolve("{?list,x}", &vars), "?x=1024");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            UriTemplate::parse("{var"),
            Err(UriTemplateError::Unterminated(0))
        );
        assert_eq!(
            UriTemplate::parse("{=var}"),
            Err(UriTemplateError::UnsupportedOperator('='))
        );
        assert!(matches!(
            UriTemplate::parse("{var:0}"),
            Err(UriTemplateError::PrefixOutOfRange(_))
        ));
        assert!(matches!(
            UriTemplate::parse("{bad name}"),
            Err(UriTemplateError::InvalidVarSpec(_))
        ));
    }

    #[test]
    fn test_variable_names() {
        let template = UriTemplate::parse("/users/{id}{?fields,sort}").unwrap();
        assert_eq!(template.variable_names(), vec!["id", "fields", "sort"]);
    }
}
