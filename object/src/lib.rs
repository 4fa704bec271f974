mod header;
mod objects;
mod selector;
mod value;

pub use header::{Header, HeaderFlags, ObjectType};
pub use objects::{
    array_allocation_size, function_allocation_size, instance_allocation_size, is_immutable,
    stack_allocation_size, str_allocation_size, Array, Boxed, Class, ClassFlags, Coroutine,
    Double, Function, Initializer, Instance, LargeInteger, Stack, Str,
};
pub use selector::{Selector, SelectorKind};
pub use value::{Failure, Value};
