//! Small serde helpers shared by the event and option types.

use std::time::Duration;

use serde::Serializer;

use crate::error::Error;

/// Renders an [`Error`] as its `Display` string for event serialization, matching the teacher's
/// convention of never implementing `Serialize` on `Error` itself (its `ErrorKind` carries
/// non-serializable data such as `Arc<std::io::Error>`).
pub(crate) fn serialize_error_as_string<S: Serializer>(
    val: &Error,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&val.to_string())
}

/// The `Option<Error>` counterpart of [`serialize_error_as_string`], used on
/// `ServerDescription::last_heartbeat_exception`.
pub(crate) fn serialize_optional_error_as_string<S: Serializer>(
    val: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Renders a duration in whole milliseconds, matching how the wire protocol (and the teacher's
/// own event serialization) represents time fields.
pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_millis() > i32::MAX as u128 => {
            serializer.serialize_i64(duration.as_millis() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_millis() as i32),
        None => serializer.serialize_none(),
    }
}
