//! Prints the CRDs kubed watches, for clusters that do not run
//! Searchlight or KubeDB (e.g. local test clusters).

use crds::{ClusterAlert, DormantDatabase};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&ClusterAlert::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&DormantDatabase::crd())?);
    Ok(())
}
