mod header;
mod message;
mod util;

pub(crate) use self::{
    message::{Message, MessageFlags, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
    util::next_request_id,
};
