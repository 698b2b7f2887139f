use bytes::Bytes;
use std::str;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

/// Set `key` to hold `value`, overwriting any previous value. The store is persisted before the
/// reply is produced.
#[derive(Debug, PartialEq)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
}

impl Executable for Set {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let mut store = store.lock();

        store.set(self.key, self.value);

        let res = Frame::Simple("OK".to_string());
        Ok(res)
    }
}

impl TryFrom<&mut CommandParser> for Set {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        if key.is_empty() {
            return Err(CommandParserError::EmptyKey);
        }

        // Values end up as JSON strings in the snapshot.
        let value = parser.next_bytes()?;
        str::from_utf8(&value)?;

        Ok(Self { key, value })
    }
}
