//! The `Get<T>` trait and its implementation in this module allows providing a single generic,
//! overloaded function `get<T>()` for all supported types of the store.

use crate::error::Error;
use crate::platform::Platform;
use crate::Kv;
use alloc::string::String;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, key: &[u8]) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, key: &[u8]) -> Result<T, Error> {
        (*self).get(key)
    }
}

impl<T: Platform> Get<Vec<u8>> for Kv<T> {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, Error> {
        self.get_bytes(key)
    }
}

impl<T: Platform> Get<String> for Kv<T> {
    fn get(&mut self, key: &[u8]) -> Result<String, Error> {
        let bytes = self.get_bytes(key)?;
        String::from_utf8(bytes).map_err(|_| Error::TypeMismatch)
    }
}

impl<T: Platform> Get<bool> for Kv<T> {
    fn get(&mut self, key: &[u8]) -> Result<bool, Error> {
        let [value] = self.get_array::<1>(key)?;
        Ok(value != 0)
    }
}

macro_rules! impl_get_int {
    ($($int:ty),*) => {
        $(
            impl<T: Platform> Get<$int> for Kv<T> {
                fn get(&mut self, key: &[u8]) -> Result<$int, Error> {
                    self.get_array(key).map(<$int>::from_le_bytes)
                }
            }
        )*
    };
}

impl_get_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Platform> Kv<T> {
    /// Reads a value that has to be exactly `N` bytes long.
    fn get_array<const N: usize>(&mut self, key: &[u8]) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        match self.read_into(key, &mut buf) {
            Ok(len) if len == N => Ok(buf),
            Ok(_) | Err(Error::BufferTooSmall(_)) => Err(Error::TypeMismatch),
            Err(e) => Err(e),
        }
    }
}
