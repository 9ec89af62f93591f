use serde_json::Value;

/// A single inbound instruction decoded from one control frame.
///
/// Parsing validates every field a variant needs before the variant is
/// produced. Anything that does not fit its declared shape becomes
/// [`Directive::Unknown`], so dispatch never inspects raw fields itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Status { content: String },
    Pong,
    Upgrade,
    Command {
        content: String,
        /// Issue time in whole seconds since the Unix epoch.
        timestamp: i64,
        /// Base64 encoded Ed25519 signature over `"{timestamp}:{content}"`.
        signature: String,
    },
    Unknown { kind: String },
}

impl Directive {
    /// Decodes a raw text frame. `Ok(None)` means the frame carried no string
    /// `type` field and should be ignored.
    pub fn parse(frame: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(frame)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        let directive = match kind {
            "status" => Directive::Status {
                content: match value.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
            },
            "pong" => Directive::Pong,
            "upgrade" => Directive::Upgrade,
            "command" => parse_command(value).unwrap_or_else(|| Directive::Unknown {
                kind: kind.to_string(),
            }),
            other => Directive::Unknown {
                kind: other.to_string(),
            },
        };
        Some(directive)
    }

    pub fn kind(&self) -> &str {
        match self {
            Directive::Status { .. } => "status",
            Directive::Pong => "pong",
            Directive::Upgrade => "upgrade",
            Directive::Command { .. } => "command",
            Directive::Unknown { kind } => kind,
        }
    }
}

fn parse_command(value: &Value) -> Option<Directive> {
    let content = value.get("content")?.as_str()?.to_string();
    let timestamp = coerce_seconds(value.get("timestamp")?)?;
    let signature = value.get("signature")?.as_str()?.to_string();
    Some(Directive::Command {
        content,
        timestamp,
        signature,
    })
}

/// Servers emit the issue time as a JSON number that may carry a fractional
/// part; only whole seconds take part in the signed payload.
fn coerce_seconds(value: &Value) -> Option<i64> {
    if let Some(secs) = value.as_i64() {
        return Some(secs);
    }
    let secs = value.as_f64()?;
    secs.is_finite().then(|| secs.trunc() as i64)
}
