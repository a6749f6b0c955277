pub mod component;
pub mod ids;
pub mod system;
pub mod variable;
