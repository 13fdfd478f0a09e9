pub mod channel;
pub use channel::{channel_pair, ChannelConnection, EnvelopeReceiver, EnvelopeSender};
