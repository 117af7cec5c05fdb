use crate::error::Error;
use crate::platform::Platform;
use crate::Kv;
use alloc::string::String;
use alloc::vec::Vec;

pub trait Set<T> {
    fn set(&mut self, key: &[u8], value: T) -> Result<(), Error>;
}

impl<T, S: Set<T>> Set<T> for &mut S {
    fn set(&mut self, key: &[u8], value: T) -> Result<(), Error> {
        (*self).set(key, value)
    }
}

impl<T: Platform> Set<&[u8]> for Kv<T> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.set_bytes(key, value)
    }
}

impl<T: Platform, const N: usize> Set<&[u8; N]> for Kv<T> {
    fn set(&mut self, key: &[u8], value: &[u8; N]) -> Result<(), Error> {
        self.set_bytes(key, value)
    }
}

impl<T: Platform> Set<Vec<u8>> for Kv<T> {
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), Error> {
        self.set_bytes(key, &value)
    }
}

impl<T: Platform> Set<&str> for Kv<T> {
    fn set(&mut self, key: &[u8], value: &str) -> Result<(), Error> {
        self.set_bytes(key, value.as_bytes())
    }
}

impl<T: Platform> Set<String> for Kv<T> {
    fn set(&mut self, key: &[u8], value: String) -> Result<(), Error> {
        self.set_bytes(key, value.as_bytes())
    }
}

impl<T: Platform> Set<bool> for Kv<T> {
    fn set(&mut self, key: &[u8], value: bool) -> Result<(), Error> {
        self.set_bytes(key, &[value as u8])
    }
}

macro_rules! impl_set_int {
    ($($int:ty),*) => {
        $(
            impl<T: Platform> Set<$int> for Kv<T> {
                fn set(&mut self, key: &[u8], value: $int) -> Result<(), Error> {
                    self.set_bytes(key, &value.to_le_bytes())
                }
            }
        )*
    };
}

impl_set_int!(u8, u16, u32, u64, i8, i16, i32, i64);
