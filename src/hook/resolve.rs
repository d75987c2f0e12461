use std::{collections::HashMap, fmt::Display};

use super::{image::HostImage, MethodId, Signature, TargetHandle};

/// A signature didn't match exactly one operation in the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureNotFound {
    pub signature: Signature,
    pub host_version: String,

    /// How many operations matched. More than one means the signature is ambiguous.
    pub candidates: usize,
}

impl Display for SignatureNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.candidates {
            0 => write!(
                f,
                "{} does not exist in host version {}",
                self.signature, self.host_version
            ),

            n => write!(
                f,
                "{} is ambiguous in host version {} ({n} candidates)",
                self.signature, self.host_version
            ),
        }
    }
}

impl std::error::Error for SignatureNotFound {}

/// Maps signatures to operations, remembering successful resolutions until the host version
/// changes.
#[derive(Default, Debug)]
pub struct Resolver {
    /// Host version the cached entries were resolved against.
    version: Option<String>,
    cache: HashMap<Signature, MethodId>,
}

impl Resolver {
    pub fn new() -> Resolver {
        Resolver::default()
    }

    pub fn resolve(
        &mut self,
        image: &dyn HostImage,
        signature: &Signature,
    ) -> Result<TargetHandle, SignatureNotFound> {
        if self.version.as_deref() != Some(image.version()) {
            if !self.cache.is_empty() {
                log::debug!(
                    "Host version changed to {}, dropping {} cached signatures.",
                    image.version(),
                    self.cache.len()
                );
            }

            self.cache.clear();
            self.version = Some(image.version().to_string());
        }

        if let Some(method) = self.cache.get(signature) {
            return Ok(TargetHandle {
                method: *method,
                signature: signature.clone(),
            });
        }

        let candidates: Vec<MethodId> = image
            .lookup(&signature.owner, &signature.member)
            .into_iter()
            .filter(|(_, params)| signature.params.as_ref().map_or(true, |p| p == params))
            .map(|(method, _)| method)
            .collect();

        match candidates.as_slice() {
            [method] => {
                log::debug!("Resolved {signature} to method {}.", method.0);

                self.cache.insert(signature.clone(), *method);

                Ok(TargetHandle {
                    method: *method,
                    signature: signature.clone(),
                })
            }

            _ => Err(SignatureNotFound {
                signature: signature.clone(),
                host_version: image.version().to_string(),
                candidates: candidates.len(),
            }),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
