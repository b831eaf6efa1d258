use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::Frame;
use crate::store::{self, Storage};

/// Returns a one line summary of the storage layout, as a simple string.
#[derive(Debug, PartialEq)]
pub struct Info;

impl Executable for Info {
    fn exec(self, store: &dyn Storage) -> Result<Frame, store::Error> {
        Ok(Frame::Simple(store.info().to_string()))
    }
}

impl TryFrom<&mut CommandParser> for Info {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        parser.finish()?;
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::commands::tests::parts;
    use crate::commands::Command;
    use crate::store::Memory;

    #[test]
    fn storage_snapshot() {
        let store = Memory::new();
        store.put(Bytes::from("foo"), Bytes::from("bar")).unwrap();

        let cmd = Command::try_from(parts(&["INFO"])).unwrap();
        let res = cmd.exec(&store).unwrap();

        assert_eq!(
            res,
            Frame::Simple(
                "read_chunks:0 total_read_log_size:0 write_log_keys:1 read_log_keys:0 total_keys:1"
                    .to_string()
            )
        );
    }

    #[test]
    fn section_argument_is_rejected() {
        let err = Command::try_from(parts(&["INFO", "server"])).unwrap_err();

        assert_eq!(err, CommandParserError::WrongNumberOfArguments);
    }
}
