
extern crate hsa_rt as hsa;
extern crate tracing as log;

use std::process::exit;

use hsa::agent;
use hsa::mem::region::Region;

use hsa_dispatch::catalog::{RegionInfo, classify, };

use tracing_subscriber::EnvFilter;

fn print_region(region: &Region) {
  println!("\tRegion ID(0x{:x}):", region.id());
  let info = match RegionInfo::query(region) {
    Ok(info) => info,
    Err(e) => {
      println!("\t\tFailed to query region: `{:?}`", e);
      return;
    },
  };
  println!("\t\tSegment: {:?}", info.segment);
  println!("\t\tGlobal Flags: {}", match info.global_flags {
    Some(flags) => format!("{:?}", flags),
    None => "N/A".to_string(),
  });
  println!("\t\tHost Accessible: {}", info.host_accessible);
  println!("\t\tSize: {}", info.size);
  println!("\t\tAlloc Max Size: {}", region.alloc_max_size().unwrap_or_default());
  println!("\t\tRuntime Alloc Allowed: {}",
           region.runtime_alloc_allowed().unwrap_or_default());
  println!("\t\tRuntime Alloc Granule: {}", info.alloc_granule);
  println!("\t\tRuntime Alloc Alignment: {}",
           region.runtime_alloc_alignment().unwrap_or_default());
  println!("\t\tDispatch Role: {}", match classify(&info) {
    Some(role) => format!("{:?}", role),
    None => "unused".to_string(),
  });
}

pub fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| EnvFilter::new("warn") ))
    .init();

  let ctxt = hsa::ApiContext::new();
  let agents = match agent::find_agents(&ctxt) {
    Ok(agents) => agents,
    Err(e) => {
      log::error!("failed to enumerate agents: {}", e);
      exit(1);
    },
  };

  for (num, agent) in agents.into_iter().enumerate() {
    println!("Agent #{}:", num);
    println!("\tName = {}", agent.name().unwrap_or_else(|_| "<bad name!>".into() ));
    println!("\tVendor = {}", agent.vendor_name().unwrap_or_else(|_| "<bad name!>".into() ));
    println!("\tFeature = {}", if let Ok(f) = agent.feature() {
      format!("{:?}", f)
    } else {
      "N/A".into()
    });
    println!("\tDevice type = {}", match agent.device_type() {
      Ok(ty) => format!("{:?}", ty),
      Err(_) => "N/A".into(),
    });
    println!("\tQueue size = {}", match agent.queue_size() {
      Ok(range) => format!("{:?}", range),
      Err(_) => "N/A".into(),
    });
    println!("\tQueue type = {}", match agent.queue_type() {
      Ok(ty) => format!("{:?}", ty),
      Err(_) => "N/A".into(),
    });
    println!("\tISA = {}", agent.isa_name().unwrap_or_else(|_| "N/A".into() ));

    match agent.all_regions() {
      Ok(regions) => {
        for region in regions.iter() {
          print_region(region);
        }
      },
      Err(e) => {
        println!("\tFailed to get available regions: `{:?}`", e);
      },
    }
  }
}
