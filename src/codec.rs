use std::marker::PhantomData;

use crate::error::GattError;

/// Converts between a typed value and its wire bytes.
pub trait ValueCodec: Send + Sync {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, GattError>;
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, GattError>;
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl ValueCodec for Utf8 {
    type Value = String;

    fn encode(&self, value: &String) -> Result<Vec<u8>, GattError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, GattError> {
        String::from_utf8(bytes.to_vec()).map_err(|error| GattError::DecodingFailed {
            reason: error.to_string(),
        })
    }
}

/// Fixed-width little-endian integer, the byte order GATT uses throughout.
#[derive(Debug, Clone, Copy, Default)]
pub struct LittleEndian<N>(PhantomData<N>);

impl<N> LittleEndian<N> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

macro_rules! little_endian_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ValueCodec for LittleEndian<$ty> {
                type Value = $ty;

                fn encode(&self, value: &$ty) -> Result<Vec<u8>, GattError> {
                    Ok(value.to_le_bytes().to_vec())
                }

                fn decode(&self, bytes: &[u8]) -> Result<$ty, GattError> {
                    let raw = bytes.try_into().map_err(|_| GattError::DecodingFailed {
                        reason: format!(
                            "expected {} bytes for {}, got {}",
                            size_of::<$ty>(),
                            stringify!($ty),
                            bytes.len()
                        ),
                    })?;
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

little_endian_codec!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Restricts `C` to decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly<C>(pub C);

impl<C: ValueCodec> ValueCodec for ReadOnly<C> {
    type Value = C::Value;

    fn encode(&self, _value: &C::Value) -> Result<Vec<u8>, GattError> {
        Err(GattError::TransformNotImplemented {
            direction: "encode",
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<C::Value, GattError> {
        self.0.decode(bytes)
    }
}

/// Restricts `C` to encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOnly<C>(pub C);

impl<C: ValueCodec> ValueCodec for WriteOnly<C> {
    type Value = C::Value;

    fn encode(&self, value: &C::Value) -> Result<Vec<u8>, GattError> {
        self.0.encode(value)
    }

    fn decode(&self, _bytes: &[u8]) -> Result<C::Value, GattError> {
        Err(GattError::TransformNotImplemented {
            direction: "decode",
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn little_endian_u16_matches_wire_order() -> anyhow::Result<()> {
        let codec = LittleEndian::<u16>::new();
        assert_eq!(vec![0x34, 0x12], codec.encode(&0x1234)?);
        assert_eq!(0x1234, codec.decode(&[0x34, 0x12])?);
        Ok(())
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x01])]
    #[case(&[0x01, 0x02, 0x03])]
    fn little_endian_rejects_wrong_width(#[case] bytes: &[u8]) {
        let result = LittleEndian::<u16>::new().decode(bytes);
        assert_matches!(result, Err(GattError::DecodingFailed { .. }));
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert_matches!(Utf8.decode(&[0xff, 0xfe]), Err(GattError::DecodingFailed { .. }));
    }

    #[test]
    fn read_only_refuses_to_encode() -> anyhow::Result<()> {
        let codec = ReadOnly(Utf8);
        assert_eq!(
            Err(GattError::TransformNotImplemented {
                direction: "encode"
            }),
            codec.encode(&"hi".to_string())
        );
        assert_eq!("hi", codec.decode(b"hi")?);
        Ok(())
    }

    #[test]
    fn write_only_refuses_to_decode() -> anyhow::Result<()> {
        let codec = WriteOnly(LittleEndian::<i8>::new());
        assert_eq!(vec![0xff], codec.encode(&-1)?);
        assert_matches!(
            codec.decode(&[0xff]),
            Err(GattError::TransformNotImplemented { direction: "decode" })
        );
        Ok(())
    }
}
