//! Conversion between typed argument tuples and wire parameter lists.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{Result, RpcError};
use super::requests::{RpcValue, TypeDescriptor};

/// Returns the descriptor used to identify `T` in method signatures.
///
/// Client and server compute descriptors the same way, so a typed proxy call
/// and a typed method registration agree as long as they use the same Rust
/// types.
pub fn type_descriptor<T: ?Sized>() -> TypeDescriptor {
    std::any::type_name::<T>().to_string()
}

/// An argument list that can cross the wire.
///
/// Implemented for `()` and tuples of up to six serializable values.
pub trait Params: Sized + Send + 'static {
    fn type_descriptors() -> Vec<TypeDescriptor>;

    fn into_values(self) -> Result<Vec<RpcValue>>;

    fn from_values(values: Vec<RpcValue>) -> Result<Self>;
}

impl Params for () {
    fn type_descriptors() -> Vec<TypeDescriptor> {
        Vec::new()
    }

    fn into_values(self) -> Result<Vec<RpcValue>> {
        Ok(Vec::new())
    }

    fn from_values(values: Vec<RpcValue>) -> Result<Self> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(arity_mismatch(0, values.len()))
        }
    }
}

fn arity_mismatch(expected: usize, actual: usize) -> RpcError {
    RpcError::Serialization(format!(
        "expected {} parameters, got {}",
        expected, actual
    ))
}

macro_rules! impl_params {
    ($count:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name),+> Params for ($($name,)+)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static),+
        {
            fn type_descriptors() -> Vec<TypeDescriptor> {
                vec![$(type_descriptor::<$name>()),+]
            }

            fn into_values(self) -> Result<Vec<RpcValue>> {
                Ok(vec![$(serde_json::to_value(self.$idx)?),+])
            }

            fn from_values(values: Vec<RpcValue>) -> Result<Self> {
                if values.len() != $count {
                    return Err(arity_mismatch($count, values.len()));
                }
                let mut values = values.into_iter();
                Ok(($(serde_json::from_value::<$name>(values.next().unwrap_or(RpcValue::Null))?,)+))
            }
        }
    };
}

impl_params!(1; A: 0);
impl_params!(2; A: 0, B: 1);
impl_params!(3; A: 0, B: 1, C: 2);
impl_params!(4; A: 0, B: 1, C: 2, D: 3);
impl_params!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_params!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
