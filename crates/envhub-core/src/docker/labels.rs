//! Label conventions shared by builder containers and the images they produce.

use std::collections::HashMap;

use crate::types::{DescriptorStatus, ImageDescriptor};

/// Set by repo2docker on the image, and by us on the builder container.
pub const REPO: &str = "repo2docker.repo";
pub const REF: &str = "repo2docker.ref";
/// Present only on builder containers; holds the image being built.
pub const BUILD: &str = "repo2docker.build";

pub const DISPLAY_NAME: &str = "tljh_repo2docker.display_name";
/// Present only on finished images.
pub const IMAGE_NAME: &str = "tljh_repo2docker.image_name";
pub const MEM_LIMIT: &str = "tljh_repo2docker.mem_limit";
pub const CPU_LIMIT: &str = "tljh_repo2docker.cpu_limit";
/// JSON object; only set when a placement constraint was requested.
pub const NODE_SELECTOR: &str = "tljh_repo2docker.node_selector";

fn get(labels: &HashMap<String, String>, key: &str) -> String {
    labels.get(key).cloned().unwrap_or_default()
}

/// Descriptor for a finished image, if the labels mark it as one of ours.
pub fn image_descriptor(labels: &HashMap<String, String>) -> Option<ImageDescriptor> {
    let image_name = labels.get(IMAGE_NAME)?.clone();
    Some(ImageDescriptor {
        repo: get(labels, REPO),
        git_ref: get(labels, REF),
        image_name,
        display_name: get(labels, DISPLAY_NAME),
        mem_limit: get(labels, MEM_LIMIT),
        cpu_limit: get(labels, CPU_LIMIT),
        status: DescriptorStatus::Built,
    })
}

/// Descriptor for a builder container that is still producing an image.
pub fn container_descriptor(labels: &HashMap<String, String>) -> Option<ImageDescriptor> {
    let image_name = labels.get(BUILD)?.clone();
    Some(ImageDescriptor {
        repo: get(labels, REPO),
        git_ref: get(labels, REF),
        image_name,
        display_name: get(labels, DISPLAY_NAME),
        mem_limit: get(labels, MEM_LIMIT),
        cpu_limit: get(labels, CPU_LIMIT),
        status: DescriptorStatus::Building,
    })
}
