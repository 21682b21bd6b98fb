//! Moving f32 data in and out of OpenVINO tensors

use anyhow::{Context, Result};
use ndarray::Array4;
use openvino::{ElementType, InferRequest, Shape, Tensor};

use super::pool::SafeCompiledModel;

/// Raw output of one model output port
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub dims: Vec<i64>,
    pub data: Vec<f32>,
}

/// Run a single-input model on an NCHW tensor and return the finished request
pub fn infer_nchw(model: &SafeCompiledModel, input: &Array4<f32>) -> Result<InferRequest> {
    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    let shape = Shape::new(&dims)?;
    let mut tensor = Tensor::new(ElementType::F32, &shape)?;

    let input_data = input
        .as_slice()
        .context("Input tensor is not in standard layout")?;
    let raw = tensor.get_raw_data_mut()?;
    if raw.len() != input_data.len() * std::mem::size_of::<f32>() {
        anyhow::bail!(
            "Tensor size mismatch: {} bytes for {} floats",
            raw.len(),
            input_data.len()
        );
    }
    for (dst, value) in raw.chunks_exact_mut(4).zip(input_data) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }

    let mut request = model.create_infer_request()?;
    request.set_input_tensor(&tensor)?;
    request.infer()?;
    Ok(request)
}

/// Read a tensor as f32 values together with its shape
pub fn read_f32(tensor: &Tensor) -> Result<OutputTensor> {
    let dims: Vec<i64> = tensor.get_shape()?.get_dimensions().to_vec();
    let raw = tensor.get_raw_data()?;
    let data = bytes_to_f32(raw);

    let expected: i64 = dims.iter().product();
    if data.len() as i64 != expected {
        anyhow::bail!("Output has {} values, shape {:?} expects {}", data.len(), dims, expected);
    }

    Ok(OutputTensor { dims, data })
}

/// Read the first output of a finished request
pub fn first_output(request: &InferRequest) -> Result<OutputTensor> {
    let tensor = request.get_output_tensor()?;
    read_f32(&tensor)
}

fn bytes_to_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
