use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::{self, Storage};

/// Set `key` to hold `value`, only if `key` does not hold a value yet.
///
/// `SET key value [EX seconds | PX milliseconds] NX`
///
/// Blind overwrites are never allowed, so `NX` is mandatory and `XX` is rejected. `EX` and `PX`
/// are accepted for compatibility, but values expire according to the storage engine
/// configuration only.
///
/// Replies `OK` when the value was stored and `nil` when the key already existed.
///
/// Ref: <https://redis.io/docs/latest/commands/set/>
#[derive(Debug, PartialEq)]
pub struct Set {
    pub key: Bytes,
    pub value: Bytes,
}

impl Executable for Set {
    fn exec(self, store: &dyn Storage) -> Result<Frame, store::Error> {
        match store.put(self.key, self.value) {
            Ok(()) => Ok(Frame::Simple("OK".to_string())),
            Err(store::Error::KeyExists) => Ok(Frame::Null),
            Err(e) => Err(e),
        }
    }
}

impl TryFrom<&mut CommandParser> for Set {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_bytes()?;
        let value = parser.next_bytes()?;

        // Unknown options are ignored, like Redis used to do:
        // https://github.com/antirez/redis/issues/2157
        let mut nx = false;
        while let Some(option) = parser.next_option() {
            match &option[..] {
                "EX" | "PX" => {
                    if !parser.skip() {
                        return Err(CommandParserError::MissingExpiryValue { option });
                    }
                }
                "XX" => return Err(CommandParserError::SetXXUnsupported),
                "NX" => nx = true,
                _ => {}
            }
        }

        if !nx {
            return Err(CommandParserError::SetNXRequired);
        }

        Ok(Self { key, value })
    }
}
