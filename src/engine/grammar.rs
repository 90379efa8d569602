//! JSON schema to GBNF conversion for grammar-constrained sampling.
//!
//! The generated grammar accepts a subset of the documents a schema
//! allows: every document it accepts validates. Optional properties keep
//! their relative order and `additionalProperties` only matters for
//! objects without declared properties.

use std::fmt::Write as _;

use serde_json::{Map, Value};

use super::{InferenceError, OutputGrammar};

/// Nesting depth beyond which a schema is rejected.
const MAX_DEPTH: usize = 32;

/// Rules every generated grammar can reference.
const BASE_RULES: &str = r#"ws ::= | " " | "\n" [ \t]{0,20}
string ::= "\"" ( [^"\\\x7F\x00-\x1F] | "\\" ( ["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] ) )* "\""
integer ::= "-"? ( "0" | [1-9] [0-9]* )
number ::= integer ( "." [0-9]+ )? ( [eE] [-+]? [0-9]+ )?
boolean ::= "true" | "false"
null ::= "null"
value ::= object | array | string | number | boolean | null
object ::= "{" ws ( string ws ":" ws value ws ( "," ws string ws ":" ws value ws )* )? "}"
array ::= "[" ws ( value ws ( "," ws value ws )* )? "]"
"#;

impl OutputGrammar {
    /// GBNF grammar whose `root` rule accepts JSON matching this constraint.
    ///
    /// `$ref`, multi-part `allOf` and non-object schemas are refused.
    pub fn to_gbnf(&self) -> Result<String, InferenceError> {
        let mut builder = GbnfBuilder::default();
        let root = builder.visit(self.schema(), 0)?;

        let mut out = format!("root ::= {root}\n");
        for (name, body) in &builder.rules {
            let _ = writeln!(out, "{name} ::= {body}");
        }
        out.push_str(BASE_RULES);
        Ok(out)
    }
}

#[derive(Default)]
struct GbnfBuilder {
    rules: Vec<(String, String)>,
}

impl GbnfBuilder {
    fn rule(&mut self, kind: &str, body: String) -> String {
        let name = format!("{kind}-{}", self.rules.len());
        self.rules.push((name.clone(), body));
        name
    }

    /// Expression matching `schema`: a base rule name or a new rule.
    fn visit(&mut self, schema: &Value, depth: usize) -> Result<String, InferenceError> {
        if depth > MAX_DEPTH {
            return Err(invalid(format!("schema nests deeper than {MAX_DEPTH} levels")));
        }
        let schema = match schema {
            Value::Bool(true) => return Ok("value".into()),
            Value::Object(schema) => schema,
            other => return Err(invalid(format!("unsupported schema: {other}"))),
        };

        if schema.contains_key("$ref") {
            return Err(InferenceError::CapabilityNotSupported("json_schema $ref".into()));
        }
        if let Some(value) = schema.get("const") {
            return Ok(literal(value));
        }
        if let Some(values) = schema.get("enum") {
            let values = non_empty(values, "enum")?;
            let body = values.iter().map(literal).collect::<Vec<_>>().join(" | ");
            return Ok(self.rule("enum", body));
        }
        for key in ["anyOf", "oneOf"] {
            if let Some(variants) = schema.get(key) {
                let alternatives = non_empty(variants, key)?
                    .iter()
                    .map(|variant| self.visit(variant, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(self.rule("alt", alternatives.join(" | ")));
            }
        }
        if let Some(parts) = schema.get("allOf") {
            return match non_empty(parts, "allOf")? {
                [single] => self.visit(single, depth + 1),
                _ => Err(InferenceError::CapabilityNotSupported(
                    "json_schema allOf with several parts".into(),
                )),
            };
        }

        match schema.get("type") {
            Some(Value::String(ty)) => self.visit_type(ty, schema, depth),
            Some(Value::Array(types)) if !types.is_empty() => {
                let mut alternatives = Vec::with_capacity(types.len());
                for ty in types {
                    let ty = ty
                        .as_str()
                        .ok_or_else(|| invalid("type entries must be strings".into()))?;
                    alternatives.push(self.visit_type(ty, schema, depth)?);
                }
                Ok(self.rule("alt", alternatives.join(" | ")))
            }
            Some(other) => Err(invalid(format!("unsupported type: {other}"))),
            None if schema.contains_key("properties") => self.visit_object(schema, depth),
            None if schema.contains_key("items") => self.visit_array(schema, depth),
            None => Ok("value".into()),
        }
    }

    fn visit_type(
        &mut self,
        ty: &str,
        schema: &Map<String, Value>,
        depth: usize,
    ) -> Result<String, InferenceError> {
        match ty {
            "string" | "integer" | "number" | "boolean" | "null" => Ok(ty.to_string()),
            "array" => self.visit_array(schema, depth),
            "object" => self.visit_object(schema, depth),
            other => Err(invalid(format!("unknown type {other}"))),
        }
    }

    fn visit_array(&mut self, schema: &Map<String, Value>, depth: usize) -> Result<String, InferenceError> {
        let item = match schema.get("items") {
            Some(items) => self.visit(items, depth + 1)?,
            None => "value".into(),
        };
        Ok(self.rule(
            "array",
            format!(r#""[" ws ( {item} ws ( "," ws {item} ws )* )? "]""#),
        ))
    }

    fn visit_object(&mut self, schema: &Map<String, Value>, depth: usize) -> Result<String, InferenceError> {
        let properties = match schema.get("properties") {
            Some(Value::Object(properties)) if !properties.is_empty() => properties,
            Some(Value::Object(_)) | None => {
                let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
                return Ok(if closed {
                    self.rule("object", r#""{" ws "}""#.to_string())
                } else {
                    "object".into()
                });
            }
            Some(other) => return Err(invalid(format!("properties must be an object, got {other}"))),
        };
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut mandatory = Vec::new();
        let mut optional = Vec::new();
        for (name, property) in properties {
            let value = self.visit(property, depth + 1)?;
            let pair = format!(
                r#"{} ws ":" ws {value} ws"#,
                literal(&Value::String(name.clone()))
            );
            if required.contains(&name.as_str()) {
                mandatory.push(pair);
            } else {
                optional.push(pair);
            }
        }

        let members = if mandatory.is_empty() {
            let mut optional = optional.into_iter();
            let first = optional.next().unwrap_or_default();
            let rest: String = optional.map(|pair| format!(r#" ( "," ws {pair} )?"#)).collect();
            format!("( {first}{rest} )?")
        } else {
            let mut members = mandatory.join(r#" "," ws "#);
            for pair in optional {
                let _ = write!(members, r#" ( "," ws {pair} )?"#);
            }
            members
        };
        Ok(self.rule("object", format!(r#""{{" ws {members} "}}""#)))
    }
}

fn invalid(reason: String) -> InferenceError {
    InferenceError::InvalidOptions(format!("json_schema: {reason}"))
}

fn non_empty<'a>(value: &'a Value, key: &str) -> Result<&'a [Value], InferenceError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .filter(|values| !values.is_empty())
        .ok_or_else(|| invalid(format!("{key} must be a non-empty array")))
}

/// GBNF literal matching the JSON text of `value`.
fn literal(value: &Value) -> String {
    let json = value.to_string();
    let mut out = String::with_capacity(json.len() + 2);
    out.push('"');
    for c in json.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
