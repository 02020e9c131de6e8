//! Prints the CustomResourceDefinitions as a multi-document YAML stream.
//!
//! `cargo run -p crds --bin crdgen > config/crd/devbox.yaml`

use crds::{Devbox, Runtime};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let docs = [
        serde_yaml::to_string(&Devbox::crd())?,
        serde_yaml::to_string(&Runtime::crd())?,
    ];
    print!("{}", docs.join("---\n"));
    Ok(())
}
