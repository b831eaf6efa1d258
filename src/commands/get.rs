use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::{self, Storage};

/// Get the value of `key`. If the key does not exist the special value `nil` is returned.
///
/// Ref: <https://redis.io/docs/latest/commands/get/>
#[derive(Debug, PartialEq)]
pub struct Get {
    pub key: Bytes,
}

impl Executable for Get {
    fn exec(self, store: &dyn Storage) -> Result<Frame, store::Error> {
        match store.get(&self.key) {
            Ok((value, _)) => Ok(Frame::Bulk(value)),
            Err(store::Error::KeyNotFound) => Ok(Frame::Null),
            Err(e) => Err(e),
        }
    }
}

impl TryFrom<&mut CommandParser> for Get {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_bytes()?;
        parser.finish()?;

        Ok(Self { key })
    }
}
