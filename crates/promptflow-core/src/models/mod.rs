pub mod block;
pub mod global_list;
pub mod run;
pub mod sequence;
pub mod variable;

pub use block::*;
pub use global_list::*;
pub use run::*;
pub use sequence::*;
pub use variable::*;
