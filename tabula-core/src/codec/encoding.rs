//! Per-type value encodings. Every function here sees only present values;
//! missing values are handled by the validity bitmap in `codec::mod`.

use std::collections::HashMap;

use bytes::BufMut;

use super::varint::{
    get_ivarint, get_len_prefixed, get_uvarint, put_ivarint, put_len_prefixed, put_uvarint, take,
};
use super::Encoding;
use crate::error::{Error, Result};
use crate::value::{DataType, NdArray, Value};

/// Output of the encoding step: strategy, shared shape and raw payload
pub(crate) struct Encoded {
    pub encoding: Encoding,
    pub shape: Vec<u32>,
    pub payload: Vec<u8>,
}

impl Encoded {
    fn new(encoding: Encoding, payload: Vec<u8>) -> Self {
        Self {
            encoding,
            shape: Vec::new(),
            payload,
        }
    }
}

/// Pick the strategy for `values` (already coerced to `data_type`) and encode them
pub(crate) fn encode_values(
    values: &[Value],
    data_type: DataType,
    dictionary_threshold: usize,
) -> Result<Encoded> {
    match data_type {
        DataType::Integer => {
            let ints = values
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| Error::type_mismatch(&data_type, v.type_name())))
                .collect::<Result<Vec<_>>>()?;
            Ok(encode_integers(&ints, dictionary_threshold))
        }
        DataType::Float => {
            let floats = values
                .iter()
                .map(|v| match v {
                    Value::Float(f) => Ok(*f),
                    other => Err(Error::type_mismatch(&data_type, other.type_name())),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(encode_floats(&floats, dictionary_threshold))
        }
        DataType::String => {
            let strings = values
                .iter()
                .map(|v| v.as_str().ok_or_else(|| Error::type_mismatch(&data_type, v.type_name())))
                .collect::<Result<Vec<_>>>()?;
            Ok(encode_strings(&strings, dictionary_threshold))
        }
        DataType::Bytes => {
            let mut payload = Vec::new();
            for v in values {
                match v {
                    Value::Bytes(b) => put_len_prefixed(&mut payload, b),
                    other => return Err(Error::type_mismatch(&data_type, other.type_name())),
                }
            }
            Ok(Encoded::new(Encoding::Plain, payload))
        }
        DataType::NdArray => match packed_shape(values) {
            Some(shape) => {
                let mut payload = Vec::new();
                for v in values {
                    if let Value::NdArray(a) = v {
                        put_f64s(&mut payload, a.data());
                    }
                }
                Ok(Encoded {
                    encoding: Encoding::Packed,
                    shape,
                    payload,
                })
            }
            None => encode_generic(values),
        },
        DataType::List | DataType::Dict | DataType::DateTime | DataType::Dynamic => {
            encode_generic(values)
        }
    }
}

/// Inverse of [`encode_values`]
pub(crate) fn decode_values(
    encoding: Encoding,
    data_type: DataType,
    shape: &[u32],
    count: usize,
    mut input: &[u8],
) -> Result<Vec<Value>> {
    let input = &mut input;
    let values = match (data_type, encoding) {
        (DataType::Integer, Encoding::Plain) => {
            read_i64s(take(input, count * 8)?).into_iter().map(Value::Integer).collect()
        }
        (DataType::Integer, Encoding::Delta) => {
            let mut out = Vec::with_capacity(count);
            let mut prev = 0i64;
            for _ in 0..count {
                prev = prev.wrapping_add(get_ivarint(input)?);
                out.push(Value::Integer(prev));
            }
            out
        }
        (DataType::Integer, Encoding::RunLength) => {
            decode_runs(input, count, |input| get_ivarint(input).map(Value::Integer))?
        }
        (DataType::Integer, Encoding::Dictionary) => {
            decode_dictionary(input, count, |input| get_ivarint(input).map(Value::Integer))?
        }
        (DataType::Float, Encoding::Plain) => {
            read_f64s(take(input, count * 8)?).into_iter().map(Value::Float).collect()
        }
        (DataType::Float, Encoding::RunLength) => {
            decode_runs(input, count, |input| read_f64(input).map(Value::Float))?
        }
        (DataType::Float, Encoding::Dictionary) => {
            decode_dictionary(input, count, |input| read_f64(input).map(Value::Float))?
        }
        (DataType::String, Encoding::Plain) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(read_string(input)?);
            }
            out
        }
        (DataType::String, Encoding::Dictionary) => decode_dictionary(input, count, read_string)?,
        (DataType::Bytes, Encoding::Plain) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push(Value::Bytes(get_len_prefixed(input)?.to_vec()));
            }
            out
        }
        (DataType::NdArray, Encoding::Packed) => {
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let per_element: usize = dims.iter().product();
            let data = read_f64s(take(input, count * per_element * 8)?);
            let mut out = Vec::with_capacity(count);
            for i in 0..count {
                let chunk = data[i * per_element..(i + 1) * per_element].to_vec();
                out.push(Value::NdArray(NdArray::new(dims.clone(), chunk)?));
            }
            out
        }
        (_, Encoding::Generic) => {
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                let bytes = get_len_prefixed(input)?;
                out.push(bincode::deserialize(bytes).map_err(|e| Error::corrupt(e.to_string()))?);
            }
            out
        }
        (ty, enc) => {
            return Err(Error::corrupt(format!(
                "encoding {:?} is not valid for {} blocks",
                enc, ty
            )))
        }
    };
    if !input.is_empty() {
        return Err(Error::corrupt(format!(
            "{} trailing payload bytes",
            input.len()
        )));
    }
    Ok(values)
}

fn encode_integers(ints: &[i64], threshold: usize) -> Encoded {
    if let Some(dict) = build_dictionary(ints.iter().copied(), threshold) {
        let mut payload = Vec::new();
        write_dictionary(&mut payload, &dict, ints.iter().copied(), |buf, v| {
            put_ivarint(buf, *v)
        });
        return Encoded::new(Encoding::Dictionary, payload);
    }

    let mut plain = Vec::with_capacity(ints.len() * 8);
    put_i64s(&mut plain, ints);

    let mut delta = Vec::new();
    let mut prev = 0i64;
    for &v in ints {
        put_ivarint(&mut delta, v.wrapping_sub(prev));
        prev = v;
    }

    let mut runs = Vec::new();
    for (v, n) in run_lengths(ints.iter().copied()) {
        put_ivarint(&mut runs, v);
        put_uvarint(&mut runs, n);
    }

    [
        Encoded::new(Encoding::Plain, plain),
        Encoded::new(Encoding::Delta, delta),
        Encoded::new(Encoding::RunLength, runs),
    ]
    .into_iter()
    .min_by_key(|e| e.payload.len())
    .unwrap_or_else(|| Encoded::new(Encoding::Plain, Vec::new()))
}

fn encode_floats(floats: &[f64], threshold: usize) -> Encoded {
    let bits = floats.iter().map(|f| f.to_bits());
    if let Some(dict) = build_dictionary(bits.clone(), threshold) {
        let mut payload = Vec::new();
        write_dictionary(&mut payload, &dict, bits, |buf, v| buf.put_u64_le(*v));
        return Encoded::new(Encoding::Dictionary, payload);
    }

    let runs: Vec<(u64, u64)> = run_lengths(bits).collect();
    if runs.len() * 4 <= floats.len() {
        let mut payload = Vec::new();
        for (v, n) in runs {
            payload.put_u64_le(v);
            put_uvarint(&mut payload, n);
        }
        return Encoded::new(Encoding::RunLength, payload);
    }

    let mut payload = Vec::with_capacity(floats.len() * 8);
    put_f64s(&mut payload, floats);
    Encoded::new(Encoding::Plain, payload)
}

fn encode_strings(strings: &[&str], threshold: usize) -> Encoded {
    if let Some(dict) = build_dictionary(strings.iter().copied(), threshold) {
        let mut payload = Vec::new();
        write_dictionary(&mut payload, &dict, strings.iter().copied(), |buf, s| {
            put_len_prefixed(buf, s.as_bytes())
        });
        return Encoded::new(Encoding::Dictionary, payload);
    }
    let mut payload = Vec::new();
    for s in strings {
        put_len_prefixed(&mut payload, s.as_bytes());
    }
    Encoded::new(Encoding::Plain, payload)
}

fn encode_generic(values: &[Value]) -> Result<Encoded> {
    let mut payload = Vec::new();
    for v in values {
        let bytes = bincode::serialize(v)?;
        put_len_prefixed(&mut payload, &bytes);
    }
    Ok(Encoded::new(Encoding::Generic, payload))
}

/// The common shape of every array in `values`, if they all share one
fn packed_shape(values: &[Value]) -> Option<Vec<u32>> {
    let mut shape: Option<&[usize]> = None;
    for v in values {
        let Value::NdArray(a) = v else { return None };
        match shape {
            None => shape = Some(a.shape()),
            Some(s) if s == a.shape() => {}
            Some(_) => return None,
        }
    }
    shape?
        .iter()
        .map(|&d| u32::try_from(d).ok())
        .collect::<Option<Vec<_>>>()
        .filter(|dims| dims.len() <= u16::MAX as usize)
}

/// Distinct values in first-appearance order, or `None` once more than
/// `threshold` have been seen
fn build_dictionary<T, I>(values: I, threshold: usize) -> Option<Vec<T>>
where
    T: Eq + std::hash::Hash + Clone,
    I: Iterator<Item = T>,
{
    if threshold == 0 {
        return None;
    }
    let mut seen = HashMap::new();
    let mut order = Vec::new();
    for v in values {
        if !seen.contains_key(&v) {
            if order.len() == threshold {
                return None;
            }
            seen.insert(v.clone(), order.len());
            order.push(v);
        }
    }
    Some(order)
}

fn write_dictionary<T, I>(
    payload: &mut Vec<u8>,
    dict: &[T],
    values: I,
    mut put: impl FnMut(&mut Vec<u8>, &T),
) where
    T: Eq + std::hash::Hash,
    I: Iterator<Item = T>,
{
    put_uvarint(payload, dict.len() as u64);
    let mut index = HashMap::with_capacity(dict.len());
    for (i, entry) in dict.iter().enumerate() {
        put(payload, entry);
        index.insert(entry, i as u64);
    }
    for v in values {
        let code = index.get(&v).copied().unwrap_or_default();
        put_uvarint(payload, code);
    }
}

fn decode_dictionary(
    input: &mut &[u8],
    count: usize,
    mut read: impl FnMut(&mut &[u8]) -> Result<Value>,
) -> Result<Vec<Value>> {
    let dict_len = get_uvarint(input)? as usize;
    let mut dict = Vec::with_capacity(dict_len.min(count.max(1)));
    for _ in 0..dict_len {
        dict.push(read(input)?);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let code = get_uvarint(input)? as usize;
        let v = dict
            .get(code)
            .ok_or_else(|| Error::corrupt(format!("dictionary code {} out of {}", code, dict_len)))?;
        out.push(v.clone());
    }
    Ok(out)
}

fn run_lengths<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> impl Iterator<Item = (T, u64)> {
    let mut runs: Vec<(T, u64)> = Vec::new();
    for v in values {
        match runs.last_mut() {
            Some((last, n)) if *last == v => *n += 1,
            _ => runs.push((v, 1)),
        }
    }
    runs.into_iter()
}

fn decode_runs(
    input: &mut &[u8],
    count: usize,
    mut read: impl FnMut(&mut &[u8]) -> Result<Value>,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let v = read(input)?;
        let n = get_uvarint(input)? as usize;
        if n == 0 || out.len() + n > count {
            return Err(Error::corrupt("run length overflows block"));
        }
        out.extend(std::iter::repeat(v).take(n));
    }
    Ok(out)
}

fn read_string(input: &mut &[u8]) -> Result<Value> {
    let bytes = get_len_prefixed(input)?;
    let s = std::str::from_utf8(bytes).map_err(|e| Error::corrupt(e.to_string()))?;
    Ok(Value::String(s.to_string()))
}

fn read_f64(input: &mut &[u8]) -> Result<f64> {
    let bytes = take(input, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(f64::from_bits(u64::from_le_bytes(raw)))
}

fn put_i64s(buf: &mut Vec<u8>, values: &[i64]) {
    if cfg!(target_endian = "little") {
        buf.extend_from_slice(bytemuck::cast_slice(values));
    } else {
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn put_f64s(buf: &mut Vec<u8>, values: &[f64]) {
    if cfg!(target_endian = "little") {
        buf.extend_from_slice(bytemuck::cast_slice(values));
    } else {
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn read_i64s(bytes: &[u8]) -> Vec<i64> {
    match bytemuck::try_cast_slice::<u8, i64>(bytes) {
        Ok(aligned) if cfg!(target_endian = "little") => aligned.to_vec(),
        _ => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                i64::from_le_bytes(raw)
            })
            .collect(),
    }
}

fn read_f64s(bytes: &[u8]) -> Vec<f64> {
    match bytemuck::try_cast_slice::<u8, f64>(bytes) {
        Ok(aligned) if cfg!(target_endian = "little") => aligned.to_vec(),
        _ => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_le_bytes(raw)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|&v| Value::Integer(v)).collect()
    }

    #[test_case(ints(&[1, 2, 1, 2, 1]), 16, Encoding::Dictionary ; "few distinct ints")]
    #[test_case(ints(&(0..1000).collect::<Vec<_>>()), 16, Encoding::Delta ; "sequential ints")]
    #[test_case(ints(&[7; 500]), 0, Encoding::RunLength ; "constant ints without dictionary")]
    #[test_case(ints(&[i64::MIN, 1 << 62, i64::MIN, 1 << 62]), 0, Encoding::Plain ; "wide ints")]
    fn test_integer_strategy(values: Vec<Value>, threshold: usize, expected: Encoding) {
        let encoded = encode_values(&values, DataType::Integer, threshold).unwrap();
        assert_eq!(encoded.encoding, expected);
        let decoded =
            decode_values(encoded.encoding, DataType::Integer, &[], values.len(), &encoded.payload)
                .unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_float_runs_and_plain() {
        let runs: Vec<Value> = (0..100).map(|i| Value::Float((i / 50) as f64)).collect();
        let encoded = encode_values(&runs, DataType::Float, 0).unwrap();
        assert_eq!(encoded.encoding, Encoding::RunLength);

        let plain: Vec<Value> = (0..100).map(|i| Value::Float(i as f64 * 0.5)).collect();
        let encoded = encode_values(&plain, DataType::Float, 0).unwrap();
        assert_eq!(encoded.encoding, Encoding::Plain);
        let decoded =
            decode_values(Encoding::Plain, DataType::Float, &[], 100, &encoded.payload).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn test_ndarray_packed_vs_generic() {
        let same: Vec<Value> = (0..3)
            .map(|i| Value::NdArray(NdArray::new(vec![2, 2], vec![i as f64; 4]).unwrap()))
            .collect();
        let encoded = encode_values(&same, DataType::NdArray, 16).unwrap();
        assert_eq!(encoded.encoding, Encoding::Packed);
        assert_eq!(encoded.shape, vec![2, 2]);

        let mixed = vec![
            Value::NdArray(NdArray::vector(vec![1.0])),
            Value::NdArray(NdArray::vector(vec![1.0, 2.0])),
        ];
        let encoded = encode_values(&mixed, DataType::NdArray, 16).unwrap();
        assert_eq!(encoded.encoding, Encoding::Generic);
    }

    #[test]
    fn test_invalid_encoding_for_type() {
        let err = decode_values(Encoding::Delta, DataType::String, &[], 1, &[0]).unwrap_err();
        assert!(matches!(err, Error::CorruptBlock { .. }));
    }
}
