//! Reader for embedded status fragments.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{ModuleState, ParseError};

const STATE_ELEMENT: &[u8] = b"ModuleState";

/// Find the first `<ModuleState>` element in `fragment` and parse its text.
///
/// Returns `Ok(None)` when the fragment has no such element or its text
/// names no known state.
///
/// # Errors
///
/// Returns [`ParseError::Fragment`] when the fragment is not well-formed XML
/// up to the point where the element is found.
pub fn read_module_state(fragment: &str) -> Result<Option<ModuleState>, ParseError> {
    let mut reader = Reader::from_str(fragment);
    reader.config_mut().trim_text(true);

    let mut inside_state = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.local_name().as_ref() == STATE_ELEMENT => {
                inside_state = true;
                text.clear();
            }
            Ok(Event::Text(chunk)) if inside_state => {
                let unescaped = chunk
                    .unescape()
                    .map_err(|e| ParseError::Fragment(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(end)) if inside_state && end.local_name().as_ref() == STATE_ELEMENT => {
                return Ok(text.parse::<ModuleState>().ok());
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                return Err(ParseError::Fragment(format!(
                    "at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
        }
    }
}
