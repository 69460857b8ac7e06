pub mod bind;
pub mod keyword;
pub mod literal;
pub mod param;
pub mod temporal;
pub mod wire;

pub use bind::{BindError, bind_parameters};
pub use keyword::{StatementKind, leading_keyword};
pub use literal::{AnsiLiterals, LiteralFormatter, OdbcEscapeLiterals, quote_string};
pub use param::{SqlParam, TypedParam};
pub use wire::{buffer_value, decode_buffer};
