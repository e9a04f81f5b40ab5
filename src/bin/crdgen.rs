//! # CRD Generator
//!
//! Prints the CustomResourceDefinition YAML of `BkApp` and
//! `DomainGroupMapping` as one multi-document stream.
//!
//! ```bash
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use bkapp_operator::crd::{BkApp, DomainGroupMapping};
use kube::CustomResourceExt;

fn main() {
    let crds = [BkApp::crd(), DomainGroupMapping::crd()];
    let mut documents = Vec::with_capacity(crds.len());
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => documents.push(yaml),
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
    print!("{}", documents.join("---\n"));
}
