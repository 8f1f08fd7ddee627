//! Wire types shared by the Phoenix server and its clients.
//!
//! Everything in this crate is plain data: the browser event channel
//! (`protocol`), the declarative tool command language (`command`), and the
//! persisted memory records (`records`). No I/O happens here.

pub mod command;
pub mod protocol;
pub mod records;
