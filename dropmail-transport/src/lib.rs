/*!
# dropmail transport

asynchronous, store and forward, transport of end to end encrypted
messages between 2 identities over a content addressed key/value network.
The 2 parties never connect to each other and are never required to be
online at the same time: everything goes through `insert` and `fetch`
operations on the network (see [`interface`]).

1. every identity publishes a [`Mailsite`]: its public key and its RTS key;
2. to open a channel, the initiator drops a Ready-To-Send ([`rts`]) at the
   recipient's RTS key. The RTS carries a fresh AES channel key wrapped
   with the recipient's public key;
3. the recipient polls its RTS key, accepts the RTS and both sides now
   share the channel key;
4. each direction of the channel is a sequence of network keys derived
   from the channel key: the [`slot`]s. A message is inserted in the next
   slot of the sender and the receiver polls a window of slots ahead of
   the last one it has seen.

The [`TransportManager`] composes all of the above and runs the
background workers (mailsite publisher, slot poller, RTS sender and RTS
fetcher).
*/

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod channel;
mod channel_transport;
mod config;
mod error;
pub mod interface;
pub mod mailsite;
mod manager;
mod memory;
pub mod rts;
mod rts_codec;
mod rts_fetcher;
mod rts_sender;
pub mod slot;
mod slot_manager;
mod slot_poller;
mod worker;

#[cfg(test)]
mod test_utils;

pub use self::{
    channel::{Channel, ChannelState, TransportMessage},
    channel_transport::{ChannelTransport, MessageCallback},
    config::Config,
    error::TransportError,
    interface::{Fetch, Insert, Network, PublicKeyDirectory},
    mailsite::{Mailsite, MailsiteData, MailsiteFetcher, MailsitePublisher},
    manager::{Account, TransportManager},
    memory::MemoryNetwork,
    rts::{ChannelEstablished, IncomingRts, RtsManager, RtsPayload, RtsRequest, RtsState},
    rts_codec::RtsEncoder,
    rts_fetcher::{RtsFetcher, RtsHandler},
    rts_sender::{RtsSender, SendReport},
    slot::{Direction, Slot, SlotRange, SlotState},
    slot_manager::{SlotManager, SlotsSnapshot},
    slot_poller::{PollReport, SlotHandler, SlotPoller},
    worker::{Job, Worker, Workers},
};
