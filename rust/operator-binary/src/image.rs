//! Resolves the workload image from the `oci-image` resource attached to the application.

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::model::{self, Model};

pub const OCI_IMAGE_RESOURCE: &str = "oci-image";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Missing resource"))]
    MissingResource,

    #[snafu(display("Invalid resource"))]
    InvalidResource { source: serde_yaml::Error },

    #[snafu(display("Invalid resource"))]
    MissingRegistryPath,

    #[snafu(display("failed to fetch resource {OCI_IMAGE_RESOURCE:?}"))]
    FetchResource { source: model::Error },
}

/// Image reference and pull credentials, in the shape the pod spec expects them.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    pub image_path: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
struct OciImageResource {
    registrypath: Option<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

pub async fn fetch_image_details(model: &impl Model) -> Result<ImageDetails, Error> {
    let contents = model
        .resource(OCI_IMAGE_RESOURCE)
        .await
        .context(FetchResourceSnafu)?
        .context(MissingResourceSnafu)?;
    parse_image_details(&contents)
}

fn parse_image_details(contents: &str) -> Result<ImageDetails, Error> {
    let resource: OciImageResource =
        serde_yaml::from_str(contents).context(InvalidResourceSnafu)?;
    Ok(ImageDetails {
        image_path: resource.registrypath.context(MissingRegistryPathSnafu)?,
        username: resource.username,
        password: resource.password,
    })
}

impl Error {
    /// `true` for errors that the operator of the deployment is expected to fix.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::FetchResource { .. })
    }
}
