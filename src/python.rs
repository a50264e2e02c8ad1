//! Python Bindings
//!
//! `LLMClient`, a blocking chunk iterator for streamed completions and a
//! module-level `completion()` shortcut. Requests and responses cross the
//! boundary as plain dicts in the OpenAI chat shape.

use crate::api::{ChunkStream, CompletionRequest, Message, Tool};
use crate::config::ProvidersConfig;
use crate::error::LlmaoError;
use crate::{Completion, LlmClient};
use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use serde::Serialize;
use std::sync::Arc;

impl From<LlmaoError> for PyErr {
    fn from(err: LlmaoError) -> PyErr {
        match &err {
            LlmaoError::Config(_) => PyValueError::new_err(err.to_string()),
            LlmaoError::Transport { .. } => PyConnectionError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// Python wrapper for the LLM client
#[pyclass(name = "LLMClient")]
struct PyLlmClient {
    inner: Arc<LlmClient>,
    runtime: Arc<tokio::runtime::Runtime>,
}

#[pymethods]
impl PyLlmClient {
    /// Create a new client
    #[new]
    #[pyo3(signature = (config_path=None, config=None))]
    fn new(config_path: Option<&str>, config: Option<&Bound<'_, PyDict>>) -> PyResult<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = LlmClient::builder();
        builder = match config_path {
            Some(path) => builder.config_path(path),
            None => builder.default_paths(),
        };
        if let Some(config) = config {
            let config: ProvidersConfig = serde_json::from_value(python_to_json(config.as_any())?)
                .map_err(|e| PyValueError::new_err(format!("Invalid config: {}", e)))?;
            builder = builder.config(config);
        }

        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| PyRuntimeError::new_err(format!("Failed to create runtime: {}", e)))?;

        Ok(Self {
            inner: Arc::new(builder.build()?),
            runtime: Arc::new(runtime),
        })
    }

    /// Make a completion request; returns a dict, or a chunk iterator when
    /// `stream=True`
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (model, messages, temperature=None, max_tokens=None, stream=None, tools=None, **kwargs))]
    fn completion(
        &self,
        py: Python<'_>,
        model: &str,
        messages: &Bound<'_, PyList>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        stream: Option<bool>,
        tools: Option<&Bound<'_, PyList>>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<Py<PyAny>> {
        let messages: Vec<Message> = serde_json::from_value(python_to_json(messages.as_any())?)
            .map_err(|e| PyValueError::new_err(format!("Invalid messages: {}", e)))?;

        let mut request = CompletionRequest::new(messages);
        request.temperature = temperature;
        request.max_tokens = max_tokens;
        request.stream = stream;

        if let Some(tools) = tools {
            let tools: Vec<Tool> = serde_json::from_value(python_to_json(tools.as_any())?)
                .map_err(|e| PyValueError::new_err(format!("Invalid tools: {}", e)))?;
            request.tools = Some(tools);
        }

        // Add extra kwargs
        if let Some(extra) = kwargs {
            for (key, value) in extra.iter() {
                let key_str: String = key.extract()?;
                request.extra.insert(key_str, python_to_json(&value)?);
            }
        }

        let client = Arc::clone(&self.inner);
        let model = model.to_string();
        let completion = self
            .runtime
            .block_on(async move { client.completion(&model, request).await })?;

        match completion {
            Completion::Response(response) => to_python(py, &response),
            Completion::Stream(stream) => {
                let iterator = PyChunkIterator {
                    stream: Some(stream),
                    runtime: Arc::clone(&self.runtime),
                };
                Ok(Py::new(py, iterator)?.into_any())
            }
        }
    }

    /// List available providers
    fn providers(&self) -> Vec<String> {
        self.inner.providers()
    }

    /// Get info about a provider
    fn provider_info(&self, py: Python<'_>, name: &str) -> PyResult<Option<Py<PyAny>>> {
        match self.inner.provider_info(name) {
            Some(info) => {
                let dict = PyDict::new(py);
                dict.set_item("name", &info.name)?;
                dict.set_item("base_url", &info.base_url)?;
                dict.set_item("models", &info.models)?;
                dict.set_item("has_keys", info.has_keys)?;
                Ok(Some(dict.into()))
            }
            None => Ok(None),
        }
    }
}

/// Blocking iterator over streamed chunks
#[pyclass(name = "ChunkIterator")]
struct PyChunkIterator {
    stream: Option<ChunkStream>,
    runtime: Arc<tokio::runtime::Runtime>,
}

#[pymethods]
impl PyChunkIterator {
    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(&mut self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match self.runtime.block_on(stream.next()) {
            Some(Ok(chunk)) => to_python(py, &chunk).map(Some),
            Some(Err(err)) => {
                self.stream = None;
                Err(err.into())
            }
            None => {
                self.stream = None;
                Ok(None)
            }
        }
    }

    /// Stop the stream and release its connection
    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.runtime.block_on(stream.close());
        }
    }
}

/// Serialize a record into Python objects via the `json` module
fn to_python<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<Py<PyAny>> {
    let text = serde_json::to_string(value)
        .map_err(|e| PyRuntimeError::new_err(format!("Failed to serialize: {}", e)))?;
    let loaded = py.import("json")?.call_method1("loads", (text,))?;
    Ok(loaded.unbind())
}

/// Convert Python object to serde_json::Value
fn python_to_json(obj: &Bound<'_, PyAny>) -> PyResult<serde_json::Value> {
    if obj.is_none() {
        Ok(serde_json::Value::Null)
    } else if let Ok(b) = obj.extract::<bool>() {
        Ok(serde_json::Value::Bool(b))
    } else if let Ok(i) = obj.extract::<i64>() {
        Ok(serde_json::Value::Number(i.into()))
    } else if let Ok(f) = obj.extract::<f64>() {
        Ok(serde_json::json!(f))
    } else if let Ok(s) = obj.extract::<String>() {
        Ok(serde_json::Value::String(s))
    } else if let Ok(list) = obj.cast::<PyList>() {
        let vec: std::result::Result<Vec<_>, _> =
            list.iter().map(|item| python_to_json(&item)).collect();
        Ok(serde_json::Value::Array(vec?))
    } else if let Ok(dict) = obj.cast::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, value) in dict.iter() {
            let key_str: String = key.extract()?;
            map.insert(key_str, python_to_json(&value)?);
        }
        Ok(serde_json::Value::Object(map))
    } else {
        // Fallback to string representation
        Ok(serde_json::Value::String(obj.str()?.to_string()))
    }
}

/// Convenience function for quick completions
#[allow(clippy::too_many_arguments)]
#[pyfunction]
#[pyo3(signature = (model, messages, temperature=None, max_tokens=None, stream=None, tools=None, **kwargs))]
fn completion(
    py: Python<'_>,
    model: &str,
    messages: &Bound<'_, PyList>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    stream: Option<bool>,
    tools: Option<&Bound<'_, PyList>>,
    kwargs: Option<&Bound<'_, PyDict>>,
) -> PyResult<Py<PyAny>> {
    let client = PyLlmClient::new(None, None)?;
    client.completion(py, model, messages, temperature, max_tokens, stream, tools, kwargs)
}

/// Python module definition
#[pymodule]
fn _llmao(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::init_logging();
    m.add_class::<PyLlmClient>()?;
    m.add_class::<PyChunkIterator>()?;
    m.add_function(wrap_pyfunction!(completion, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
