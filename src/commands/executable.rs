use crate::frame::Frame;
use crate::store::{self, Storage};

pub trait Executable {
    /// Runs the command against `store`.
    ///
    /// Outcomes the protocol has a reply for, such as a missing key, are returned as frames.
    /// Any other storage error is returned as is, and it is up to the caller to decide whether it
    /// is reported to the client or brings the server down.
    fn exec(self, store: &dyn Storage) -> Result<Frame, store::Error>;
}
