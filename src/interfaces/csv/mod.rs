//! CSV adapters used by the command line front end.

pub mod payment_reader;
pub mod response_writer;
