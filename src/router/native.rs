//! The closed set of requests the bridge answers itself.
//!
//! A name carrying the native prefix (`Swift.` by default) is matched against
//! this table. Anything else, including unknown prefixed names, is forwarded
//! to the pages untouched.

use serde_json::Value;
use url::Url;

use super::menu::Translator;
use crate::http::HttpRequest;
use crate::message::{MalformedMessage, TabId};

#[derive(Debug, Clone, PartialEq)]
pub enum NativeRequest {
    /// Open a window. With a close token, the runtime is told when it closes.
    OpenWindow {
        url: String,
        close_token: Option<Value>,
    },
    OpenTab {
        url: String,
    },
    CloseTab {
        tab_id: TabId,
    },
    Activate,
    GetVersion,
    GetBaseUri,
    GetCurrentLocale,
    GetDefaultLocale,
    GetDateFormats,
    GetFileContents {
        path: String,
    },
    GetPrefs,
    SetPrefs {
        blob: String,
    },
    UpdateButton {
        image_path: String,
        tooltip: String,
        translators: Vec<Translator>,
    },
    GlobalAvailable,
    HttpRequest(HttpRequest),
}

fn positional<'a>(name: &str, args: &'a Value) -> Result<&'a Vec<Value>, MalformedMessage> {
    args.as_array()
        .ok_or_else(|| MalformedMessage::bad_args(name, "expected an argument array"))
}

fn string_at(name: &str, args: &[Value], index: usize) -> Result<String, MalformedMessage> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MalformedMessage::bad_args(name, format!("argument {} must be a string", index)))
}

/// A URL argument. Spaces are escaped before parsing.
fn url_at(name: &str, args: &[Value], index: usize) -> Result<String, MalformedMessage> {
    let url = string_at(name, args, index)?.replace(' ', "%20");
    Url::parse(&url).map_err(|e| MalformedMessage::bad_args(name, format!("bad url: {}", e)))?;
    Ok(url)
}

fn translators(name: &str, value: Option<&Value>) -> Result<Vec<Translator>, MalformedMessage> {
    let rows = value
        .and_then(Value::as_array)
        .ok_or_else(|| MalformedMessage::bad_args(name, "translators must be an array"))?;

    rows.iter()
        .map(|row| {
            let fields: Option<Vec<&str>> = row
                .as_array()
                .and_then(|cells| cells.iter().map(Value::as_str).collect());
            match fields.as_deref() {
                Some([id, label, ..]) => Ok(Translator {
                    id: id.to_string(),
                    label: label.to_string(),
                }),
                _ => Err(MalformedMessage::bad_args(
                    name,
                    "translator rows must be [id, label] strings",
                )),
            }
        })
        .collect()
}

impl NativeRequest {
    /// Match a message from the runtime against the native table.
    ///
    /// `Ok(None)` means "not ours, forward it". A native name with arguments
    /// of the wrong shape is an error; the caller drops the message.
    pub fn parse(prefix: &str, name: &str, args: &Value) -> Result<Option<Self>, MalformedMessage> {
        let Some(native) = name.strip_prefix(prefix) else {
            return Ok(None);
        };

        let request = match native {
            "openWindow" => {
                let list = positional(name, args)?;
                NativeRequest::OpenWindow {
                    url: url_at(name, list, 0)?,
                    close_token: list.get(1).filter(|v| !v.is_null()).cloned(),
                }
            }
            "openTab" => NativeRequest::OpenTab {
                url: url_at(name, positional(name, args)?, 0)?,
            },
            "closeTab" => {
                let tab_id = positional(name, args)?
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| MalformedMessage::bad_args(name, "tab id must be an integer"))?;
                NativeRequest::CloseTab { tab_id }
            }
            "activate" => NativeRequest::Activate,
            "getVersion" => NativeRequest::GetVersion,
            "getBaseURI" => NativeRequest::GetBaseUri,
            "getCurrentLocale" => NativeRequest::GetCurrentLocale,
            "getDefaultLocale" => NativeRequest::GetDefaultLocale,
            "getDateFormatsJSON" => NativeRequest::GetDateFormats,
            "getFileContents" => NativeRequest::GetFileContents {
                path: string_at(name, positional(name, args)?, 0)?,
            },
            "getPrefs" => NativeRequest::GetPrefs,
            "setPrefs" => NativeRequest::SetPrefs {
                blob: args
                    .as_str()
                    .ok_or_else(|| MalformedMessage::bad_args(name, "preferences must be a string"))?
                    .to_string(),
            },
            "updateButton" => {
                let list = positional(name, args)?;
                NativeRequest::UpdateButton {
                    image_path: string_at(name, list, 0)?,
                    tooltip: string_at(name, list, 1)?,
                    translators: translators(name, list.get(2))?,
                }
            }
            "globalAvailable" => NativeRequest::GlobalAvailable,
            "httpRequest" => {
                let list = positional(name, args)?;
                let method = list.first().and_then(Value::as_str);
                let url = string_at(name, list, 1)?;
                let options = list.get(2).cloned().unwrap_or(Value::Null);
                NativeRequest::HttpRequest(HttpRequest::from_parts(method, &url, &options))
            }
            _ => return Ok(None),
        };

        Ok(Some(request))
    }
}
