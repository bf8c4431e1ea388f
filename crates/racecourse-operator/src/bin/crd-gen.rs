use kube::CustomResourceExt;
use racecourse_operator::Racecourse;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&Racecourse::crd())?;
    print!("{yaml}");
    Ok(())
}
