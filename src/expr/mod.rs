//! The user expression language used in query `where` clauses.
//!
//! ```
//! use butlerdb::expr::parse;
//!
//! let tree = parse("instrument = 'HSC' AND visit IN (1..10:2)").unwrap().unwrap();
//! assert_eq!(tree.identifiers(), vec!["instrument", "visit"]);
//! ```

mod convert;
mod lexer;
mod parser;
mod tree;

pub use convert::{BindValue, ConversionContext, ConvertedExpression, convert};
pub use parser::{ParseError, parse};
pub use tree::{BinaryOperator, Node, UnaryOperator};
