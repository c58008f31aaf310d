//! Output lines for inserted rows.

use std::io::{self, Write};

use parking_lot::Mutex;
use serde_json::Value;

use tablewatch_client::{CallbackError, ChangeHandler};
use tablewatch_proto::ChangeEventRecord;

/// Column holding the author of a message.
pub const USER_COLUMN: &str = "user_id";

/// Column holding the message body.
pub const MESSAGE_COLUMN: &str = "message";

/// Rendering of a column the record does not carry.
pub const UNDEFINED: &str = "undefined";

/// Render a column value for output.
///
/// Strings print raw, a missing column prints `undefined`, and every other
/// value (null included) prints its JSON text.
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None => UNDEFINED.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// `Новое сообщение от пользователя <user_id>: <message>`
pub fn format_insert_line(record: &ChangeEventRecord) -> String {
    format!(
        "Новое сообщение от пользователя {}: {}",
        render_value(record.field(USER_COLUMN)),
        render_value(record.field(MESSAGE_COLUMN)),
    )
}

/// Line for a message column carrying a JSON document with a `text` or
/// `voice` key.
pub fn format_decoded_line(record: &ChangeEventRecord) -> String {
    let user = render_value(record.field(USER_COLUMN));
    let raw = render_value(record.field(MESSAGE_COLUMN));

    let document = match record.field(MESSAGE_COLUMN) {
        Some(Value::String(text)) => serde_json::from_str::<Value>(text),
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        Some(_) | None => serde_json::from_str::<Value>(&raw),
    };

    match document {
        Ok(Value::Object(map)) => {
            if let Some(text) = map.get("text") {
                format!(
                    "Новое текстовое сообщение от пользователя {}: {}",
                    user,
                    render_value(Some(text))
                )
            } else if let Some(voice) = map.get("voice") {
                format!(
                    "Новое голосовое сообщение от пользователя {}: {}",
                    user,
                    render_value(Some(voice))
                )
            } else {
                format!("Неизвестный формат сообщения от пользователя {}: {}", user, raw)
            }
        }
        Ok(_) => format!("Неизвестный формат сообщения от пользователя {}: {}", user, raw),
        Err(_) => format!("Не удалось декодировать JSON для пользователя {}: {}", user, raw),
    }
}

/// Writes one line per inserted row.
pub struct InsertPrinter<W> {
    out: Mutex<W>,
    decode_payload: bool,
}

impl InsertPrinter<io::Stdout> {
    /// Printer writing to standard output.
    pub fn stdout(decode_payload: bool) -> Self {
        Self::new(io::stdout(), decode_payload)
    }
}

impl<W: Write> InsertPrinter<W> {
    /// Printer writing to `out`.
    pub fn new(out: W, decode_payload: bool) -> Self {
        Self {
            out: Mutex::new(out),
            decode_payload,
        }
    }

    /// Line for `record`.
    pub fn line(&self, record: &ChangeEventRecord) -> String {
        if self.decode_payload {
            format_decoded_line(record)
        } else {
            format_insert_line(record)
        }
    }

    /// Consume the printer and return its writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send + 'static> ChangeHandler for InsertPrinter<W> {
    fn handle(&self, record: &ChangeEventRecord) -> Result<(), CallbackError> {
        let line = self.line(record);
        let mut out = self.out.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}
