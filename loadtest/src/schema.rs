//! Runtime protocol definitions
//!
//! The `.proto` file is compiled once at startup with `protox`, so the run
//! fails before any virtual user starts when the definition is missing,
//! malformed, or does not describe the methods the scenario invokes.

use prost_types::field_descriptor_proto::Type;
use prost_types::{DescriptorProto, FileDescriptorSet};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading or querying a protocol definition
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Protocol definition not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to compile {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("Invalid method name '{0}', expected package.Service/Method")]
    InvalidMethodName(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Method {0} is streaming, only unary methods can be invoked")]
    StreamingMethod(String),

    #[error("Message type not found: {0}")]
    MessageNotFound(String),

    #[error("Message {message} has no field '{field}'")]
    MissingField { message: String, field: String },

    #[error("Field {message}.{field} is not a varint integer (int64, uint64, int32, uint32)")]
    NonIntegerField { message: String, field: String },

    #[error("Field {message}.{field} has number {found}, expected {expected}")]
    FieldNumberMismatch {
        message: String,
        field: String,
        expected: i32,
        found: i32,
    },
}

/// A single field of a message type
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub number: i32,
    pub kind: Type,
}

impl FieldSchema {
    /// Varint integer types that decode an `int64` operand unchanged
    fn is_varint_integer(&self) -> bool {
        matches!(
            self.kind,
            Type::Int64 | Type::Uint64 | Type::Int32 | Type::Uint32
        )
    }
}

/// A method as declared by its service
#[derive(Debug, Clone)]
pub struct MethodSchema {
    pub name: String,
    /// Fully qualified input message name, without the leading dot
    pub input_type: String,
    /// Fully qualified output message name, without the leading dot
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// A service and its methods
#[derive(Debug, Clone)]
pub struct ServiceSchema {
    /// Fully qualified name (`package.Service`)
    pub name: String,
    pub methods: Vec<MethodSchema>,
}

/// A resolved, invocable unary method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodPath {
    service: String,
    method: String,
    input_type: String,
    output_type: String,
}

impl MethodPath {
    /// `package.Service/Method`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    /// HTTP/2 request path (`/package.Service/Method`)
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Bare method name (`Add`)
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn input_type(&self) -> &str {
        &self.input_type
    }

    pub fn output_type(&self) -> &str {
        &self.output_type
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

/// Services and message types compiled from a protocol definition
#[derive(Debug, Clone)]
pub struct ProtoSchema {
    source: PathBuf,
    services: HashMap<String, ServiceSchema>,
    messages: HashMap<String, Vec<FieldSchema>>,
}

impl ProtoSchema {
    /// Compile `proto_file` and index its services and messages.
    ///
    /// The file is looked up as given first, then under each import path.
    /// Import paths that exist, plus the file's own directory, are used to
    /// resolve its imports.
    pub fn load(import_paths: &[PathBuf], proto_file: &Path) -> Result<Self, SchemaError> {
        let file = locate(import_paths, proto_file)?;
        let mut includes = Vec::with_capacity(import_paths.len() + 1);
        if let Some(parent) = file.parent() {
            includes.push(parent.to_path_buf());
        }
        includes.extend(
            import_paths
                .iter()
                .filter(|p| p.is_dir())
                .filter_map(|p| p.canonicalize().ok()),
        );

        debug!("Compiling {} with includes {:?}", file.display(), includes);
        let fds = protox::compile([&file], &includes).map_err(|e| SchemaError::Compile {
            path: file.clone(),
            message: e.to_string(),
        })?;

        let schema = Self::from_descriptor_set(file, fds);
        info!(
            "Loaded protocol definition {} ({} services, {} messages)",
            schema.source.display(),
            schema.services.len(),
            schema.messages.len()
        );
        Ok(schema)
    }

    /// Index an already compiled descriptor set
    pub fn from_descriptor_set(source: PathBuf, fds: FileDescriptorSet) -> Self {
        let mut services = HashMap::new();
        let mut messages = HashMap::new();

        for file in &fds.file {
            let package = file.package();

            for message in &file.message_type {
                index_message(package, message, &mut messages);
            }

            for service in &file.service {
                let name = qualify(package, service.name());
                let methods = service
                    .method
                    .iter()
                    .map(|m| MethodSchema {
                        name: m.name().to_string(),
                        input_type: m.input_type().trim_start_matches('.').to_string(),
                        output_type: m.output_type().trim_start_matches('.').to_string(),
                        client_streaming: m.client_streaming(),
                        server_streaming: m.server_streaming(),
                    })
                    .collect();
                services.insert(name.clone(), ServiceSchema { name, methods });
            }
        }

        Self {
            source,
            services,
            messages,
        }
    }

    /// Path of the compiled protocol definition
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Look up a service by its fully qualified name
    pub fn service(&self, name: &str) -> Result<&ServiceSchema, SchemaError> {
        self.services
            .get(name)
            .ok_or_else(|| SchemaError::ServiceNotFound(name.to_string()))
    }

    /// Resolve `package.Service/Method` to an invocable unary method
    pub fn resolve(&self, full_name: &str) -> Result<MethodPath, SchemaError> {
        let (service_name, method_name) = full_name
            .split_once('/')
            .filter(|(s, m)| !s.is_empty() && !m.is_empty() && !m.contains('/'))
            .ok_or_else(|| SchemaError::InvalidMethodName(full_name.to_string()))?;

        let service = self.service(service_name)?;
        let method = service
            .methods
            .iter()
            .find(|m| m.name == method_name)
            .ok_or_else(|| SchemaError::MethodNotFound(full_name.to_string()))?;

        if method.client_streaming || method.server_streaming {
            return Err(SchemaError::StreamingMethod(full_name.to_string()));
        }

        Ok(MethodPath {
            service: service.name.clone(),
            method: method.name.clone(),
            input_type: method.input_type.clone(),
            output_type: method.output_type.clone(),
        })
    }

    /// Fields of a message type, by fully qualified name
    pub fn fields(&self, message: &str) -> Result<&[FieldSchema], SchemaError> {
        self.messages
            .get(message.trim_start_matches('.'))
            .map(Vec::as_slice)
            .ok_or_else(|| SchemaError::MessageNotFound(message.to_string()))
    }

    /// Ensure the method's input message lays out each `(name, number)`
    /// field as a varint integer, matching the request the client encodes
    pub fn require_integer_fields(
        &self,
        method: &MethodPath,
        expected: &[(&str, i32)],
    ) -> Result<(), SchemaError> {
        let message = method.input_type();
        let fields = self.fields(message)?;
        for &(name, number) in expected {
            let field = fields
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| SchemaError::MissingField {
                    message: message.to_string(),
                    field: name.to_string(),
                })?;
            if field.number != number {
                return Err(SchemaError::FieldNumberMismatch {
                    message: message.to_string(),
                    field: name.to_string(),
                    expected: number,
                    found: field.number,
                });
            }
            if !field.is_varint_integer() {
                return Err(SchemaError::NonIntegerField {
                    message: message.to_string(),
                    field: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn locate(import_paths: &[PathBuf], proto_file: &Path) -> Result<PathBuf, SchemaError> {
    std::iter::once(proto_file.to_path_buf())
        .chain(import_paths.iter().map(|dir| dir.join(proto_file)))
        .find(|candidate| candidate.is_file())
        .and_then(|found| found.canonicalize().ok())
        .ok_or_else(|| SchemaError::NotFound(proto_file.to_path_buf()))
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

fn index_message(
    scope: &str,
    message: &DescriptorProto,
    out: &mut HashMap<String, Vec<FieldSchema>>,
) {
    let name = qualify(scope, message.name());
    for nested in &message.nested_type {
        index_message(&name, nested, out);
    }
    let fields = message
        .field
        .iter()
        .map(|f| FieldSchema {
            name: f.name().to_string(),
            number: f.number(),
            kind: f.r#type(),
        })
        .collect();
    out.insert(name, fields);
}
