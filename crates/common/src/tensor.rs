//! Tensor byte codecs for the weight-update path
//!
//! The control channel carries only a `(name, dtype, shape)` descriptor;
//! the payload crosses the collective group as raw little-endian bytes.
//! These helpers convert between that byte form and `candle` tensors on
//! both ends of the broadcast.

use crate::error::{Result, SwapServeError};
use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

/// Element dtype of a broadcast parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDType {
    F16,
    BF16,
    F32,
    F64,
}

impl ParamDType {
    /// Parse a wire dtype string. Accepts both bare names
    /// (`"float32"`) and qualified ones (`"torch.float32"`); only the
    /// last dot-separated segment is significant.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.rsplit('.').next().unwrap_or(raw);
        match name {
            "float16" | "half" => Ok(ParamDType::F16),
            "bfloat16" => Ok(ParamDType::BF16),
            "float32" | "float" => Ok(ParamDType::F32),
            "float64" | "double" => Ok(ParamDType::F64),
            other => Err(SwapServeError::invalid_input(format!(
                "unsupported parameter dtype: {}",
                other
            ))),
        }
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamDType::F16 => "float16",
            ParamDType::BF16 => "bfloat16",
            ParamDType::F32 => "float32",
            ParamDType::F64 => "float64",
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ParamDType::F16 | ParamDType::BF16 => 2,
            ParamDType::F32 => 4,
            ParamDType::F64 => 8,
        }
    }

    /// Matching candle dtype.
    pub fn to_dtype(&self) -> DType {
        match self {
            ParamDType::F16 => DType::F16,
            ParamDType::BF16 => DType::BF16,
            ParamDType::F32 => DType::F32,
            ParamDType::F64 => DType::F64,
        }
    }

    /// Convert from a candle dtype.
    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(ParamDType::F16),
            DType::BF16 => Ok(ParamDType::BF16),
            DType::F32 => Ok(ParamDType::F32),
            DType::F64 => Ok(ParamDType::F64),
            other => Err(SwapServeError::tensor(format!(
                "unsupported tensor dtype: {:?}",
                other
            ))),
        }
    }
}

/// Total byte length of a parameter with the given dtype and shape.
pub fn byte_len(dtype: ParamDType, shape: &[usize]) -> usize {
    dtype.size_in_bytes() * shape.iter().product::<usize>()
}

/// Wire dtype string for a tensor, as sent in `update_named_param`.
pub fn dtype_string(tensor: &Tensor) -> Result<String> {
    Ok(ParamDType::from_dtype(tensor.dtype())?.as_str().to_string())
}

/// Serialize a tensor's elements to little-endian bytes.
pub fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    match tensor.dtype() {
        DType::F16 => Ok(flat
            .to_vec1::<f16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        DType::BF16 => Ok(flat
            .to_vec1::<bf16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        DType::F32 => Ok(flat
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        DType::F64 => Ok(flat
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()),
        other => Err(SwapServeError::tensor(format!(
            "unsupported tensor dtype: {:?}",
            other
        ))),
    }
}

/// Rebuild a tensor from little-endian bytes received over the
/// collective broadcast.
pub fn tensor_from_bytes(dtype: ParamDType, shape: &[usize], bytes: &[u8]) -> Result<Tensor> {
    let expected = byte_len(dtype, shape);
    if bytes.len() != expected {
        return Err(SwapServeError::tensor(format!(
            "payload of {} bytes does not match {:?} x {:?} ({} bytes)",
            bytes.len(),
            dtype,
            shape,
            expected
        )));
    }

    let tensor = match dtype {
        ParamDType::F16 => {
            let vals: Vec<f16> = bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(vals, shape, &Device::Cpu)?
        }
        ParamDType::BF16 => {
            let vals: Vec<bf16> = bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_vec(vals, shape, &Device::Cpu)?
        }
        ParamDType::F32 => {
            let vals: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(vals, shape, &Device::Cpu)?
        }
        ParamDType::F64 => {
            let vals: Vec<f64> = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_vec(vals, shape, &Device::Cpu)?
        }
    };

    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_qualified_names() {
        assert_eq!(ParamDType::parse("torch.float32").unwrap(), ParamDType::F32);
        assert_eq!(ParamDType::parse("bfloat16").unwrap(), ParamDType::BF16);
        assert_eq!(ParamDType::parse("half").unwrap(), ParamDType::F16);
    }

    #[test]
    fn parse_rejects_unknown_dtype() {
        assert!(ParamDType::parse("int3").is_err());
    }

    #[test]
    fn f32_bytes_round_trip() {
        let data: Vec<f32> = (0..16).map(|v| v as f32 * 0.5).collect();
        let tensor = Tensor::from_vec(data.clone(), &[4, 4][..], &Device::Cpu).unwrap();

        let bytes = tensor_to_bytes(&tensor).unwrap();
        assert_eq!(bytes.len(), byte_len(ParamDType::F32, &[4, 4]));

        let back = tensor_from_bytes(ParamDType::F32, &[4, 4], &bytes).unwrap();
        assert_eq!(back.dims(), &[4, 4]);
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            data
        );
    }

    #[test]
    fn bf16_bytes_round_trip() {
        let data: Vec<bf16> = (0..6).map(|v| bf16::from_f32(v as f32)).collect();
        let tensor = Tensor::from_vec(data.clone(), &[2, 3][..], &Device::Cpu).unwrap();

        let bytes = tensor_to_bytes(&tensor).unwrap();
        let back = tensor_from_bytes(ParamDType::BF16, &[2, 3], &bytes).unwrap();
        assert_eq!(
            back.flatten_all().unwrap().to_vec1::<bf16>().unwrap(),
            data
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let bytes = vec![0u8; 10];
        assert!(tensor_from_bytes(ParamDType::F32, &[4, 4], &bytes).is_err());
    }

    #[test]
    fn dtype_string_matches_wire_names() {
        let tensor = Tensor::zeros(&[2][..], DType::F32, &Device::Cpu).unwrap();
        assert_eq!(dtype_string(&tensor).unwrap(), "float32");
    }
}
