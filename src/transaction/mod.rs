//! Transaction Module
//!
//! Per-node bookkeeping for transactions, on both sides of the two-phase protocol.
//!
//! ## Core Concepts
//! - **Local transactions**: opened on the originator. Writes are staged here and only leave
//!   the node at prepare time; the table remembers which nodes took part in the prepare.
//! - **Remote transactions**: prepared state held by a participant until commit or rollback.
//!   Losing it (a crash, or a rebalance that moved its keys away) makes the participant ask
//!   for a resend on commit.
//! - **Completed registry**: recently finished transactions, so a duplicate commit or a
//!   re-sent one-phase prepare is acknowledged without being applied twice.

pub mod table;


pub use table::{LocalTransaction, RemoteTransaction, TransactionTable};
