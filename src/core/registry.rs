// src/core/registry.rs

//! The built-in command table and the per-run registry of user commands.

use crate::core::commands;
use crate::core::engine::{Engine, EngineError};
use crate::models::{CommandStep, StepOutcome};
use std::collections::BTreeMap;

pub type CustomHandler =
    fn(&mut Engine, &'static CommandDefinition, &CommandStep) -> Result<StepOutcome, EngineError>;

/// Positional arguments the engine supplies before any looked-up values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    /// The mosaic dataset path.
    Dataset,
    /// Nothing, but a leading `#` is replaced by the mosaic dataset path.
    DatasetWhenOmitted,
    Nothing,
    /// `AMD_<md>_ART` inside the geodatabase.
    RasterTypeTable,
    /// `AMD_<md>_LOG` inside the geodatabase.
    LogTable,
}

#[derive(Debug, Clone, Copy)]
pub enum Handler {
    /// Remaining arguments follow the tool's declared parameter names.
    Dynamic { function: &'static str, lead: Lead },
    /// Arguments follow an explicit list of process-table keys.
    Fixed {
        function: &'static str,
        lead: Lead,
        params: &'static [&'static str],
    },
    Custom(CustomHandler),
}

/// Defines a built-in command: its code, description, process-table key and handler.
#[derive(Debug)]
pub struct CommandDefinition {
    pub code: &'static str,
    pub desc: &'static str,
    pub process_key: &'static str,
    pub handler: Handler,
}

const fn dynamic(
    code: &'static str,
    desc: &'static str,
    process_key: &'static str,
    function: &'static str,
    lead: Lead,
) -> CommandDefinition {
    CommandDefinition {
        code,
        desc,
        process_key,
        handler: Handler::Dynamic { function, lead },
    }
}

const fn fixed(
    code: &'static str,
    desc: &'static str,
    process_key: &'static str,
    function: &'static str,
    lead: Lead,
    params: &'static [&'static str],
) -> CommandDefinition {
    CommandDefinition {
        code,
        desc,
        process_key,
        handler: Handler::Fixed {
            function,
            lead,
            params,
        },
    }
}

const fn custom(
    code: &'static str,
    desc: &'static str,
    process_key: &'static str,
    handler: CustomHandler,
) -> CommandDefinition {
    CommandDefinition {
        code,
        desc,
        process_key,
        handler: Handler::Custom(handler),
    }
}

use Lead::{Dataset, DatasetWhenOmitted, LogTable, Nothing, RasterTypeTable};

pub static BUILTIN_COMMANDS: &[CommandDefinition] = &[
    custom("CM", "Create a new mosaic dataset.", "", commands::create_mosaic_dataset),
    custom("CR", "Create new referenced mosaic datasets.", "", commands::create_referenced_mosaic_datasets),
    custom("AF", "Add fields.", "", commands::add_fields),
    custom("AR", "Add rasters/data to a mosaic dataset.", "", commands::add_rasters),
    custom("BF", "Build footprint.", "buildfootprint", commands::build_footprints),
    fixed(
        "JF",
        "Join fields.",
        "joinfield",
        "management.JoinField",
        Nothing,
        &["in_data", "in_field", "join_table", "join_field", "fields"],
    ),
    custom("BS", "Build Seamlines.", "buildseamlines", commands::build_seamlines),
    fixed(
        "BP",
        "Build Pyramid.",
        "buildpyramids",
        "management.BuildPyramids",
        Dataset,
        &["pyramid_level", "skip_first", "resample_technique", "compression_type", "compression_quality", "skip_existing"],
    ),
    dynamic("ANCP", "Analyze control points.", "analyzecontrolpoints", "management.AnalyzeControlPoints", Dataset),
    dynamic("APCP", "Append control points.", "appendcontrolpoints", "management.AppendControlPoints", Nothing),
    dynamic("ABA", "Apply block adjustment.", "applyblockadjustment", "management.ApplyBlockAdjustment", Dataset),
    dynamic("CBA", "Compute block adjustment.", "computeblockadjustment", "management.ComputeBlockAdjustment", Dataset),
    dynamic("CCP", "Compute control points.", "computecontrolpoints", "management.ComputeControlPoints", Dataset),
    dynamic("CTP", "Compute tie points.", "computetiepoints", "management.ComputeTiePoints", Dataset),
    dynamic("AMDS", "Alter mosaic dataset schema.", "altermosaicdatasetschema", "management.AlterMosaicDatasetSchema", Dataset),
    dynamic("AMD", "Analyze mosaic dataset.", "analyzemosaicdataset", "management.AnalyzeMosaicDataset", Dataset),
    dynamic(
        "BMDIC",
        "Build mosaic dataset item cache.",
        "buildmosaicdatasetitemcache",
        "management.BuildMosaicDatasetItemCache",
        Dataset,
    ),
    dynamic("CDA", "Compute dirty area.", "computedirtyarea", "management.ComputeDirtyArea", Dataset),
    dynamic("GEA", "Generate exclude area.", "generateexcludearea", "management.GenerateExcludeArea", Nothing),
    fixed(
        "CS",
        "Calculate statistics.",
        "calculatestatistics",
        "management.CalculateStatistics",
        Dataset,
        &["x_skip_factor", "y_skip_factor", "ignore_values", "skip_existing", "area_of_interest"],
    ),
    fixed(
        "RP",
        "Repair mosaic dataset paths.",
        "repairmosaicdatasetpaths",
        "management.RepairMosaicDatasetPaths",
        Dataset,
        &["paths_list", "where_clause"],
    ),
    fixed(
        "CBMD",
        "Color balance mosaic dataset.",
        "colorbalancemosaicdataset",
        "management.ColorBalanceMosaicDataset",
        Dataset,
        &["balancing_method", "color_surface_type", "target_raster", "exclude_raster", "stretch_type", "gamma", "block_field"],
    ),
    fixed(
        "RRFMD",
        "Remove rasters from mosaic dataset.",
        "removerastersfrommosaicdataset",
        "management.RemoveRastersFromMosaicDataset",
        Dataset,
        &[
            "where_clause",
            "update_boundary",
            "mark_overviews_items",
            "delete_overview_images",
            "delete_item_cache",
            "remove_items",
            "update_cellsize_ranges",
        ],
    ),
    fixed(
        "DMD",
        "Delete mosaic dataset.",
        "deletemosaicdataset",
        "management.DeleteMosaicDataset",
        Dataset,
        &["delete_overview_images", "delete_item_cache"],
    ),
    fixed(
        "MMDI",
        "Merge mosaic dataset items.",
        "mergemosaicdatasetitems",
        "management.MergeMosaicDatasetItems",
        Dataset,
        &["where_clause", "block_field", "max_rows_per_merged_items"],
    ),
    custom(
        "BPS",
        "Build pyramid and statistics.",
        "buildpyramidsandstatistics",
        commands::build_pyramids_and_statistics,
    ),
    custom("ERF", "Edit raster function.", "editrasterfunction", commands::edit_raster_function),
    custom("DN", "Define no data values.", "definemosaicdatasetnodata", commands::define_nodata),
    custom("SP", "Set mosaic dataset properties.", "", commands::set_properties),
    custom("IG", "Import mosaic dataset geometry.", "importgeometry", commands::import_geometry),
    fixed("DF", "Delete field.", "deletefield", "management.DeleteField", Dataset, &["drop_field"]),
    custom("IF", "Import field values/calculate fields.", "importfieldvalues", commands::import_field_values),
    fixed(
        "BB",
        "Build boundary.",
        "buildboundary",
        "management.BuildBoundary",
        Dataset,
        &["where_clause", "append_to_existing", "simplification_method"],
    ),
    custom("SS", "Set statistics for a raster or mosaic dataset.", "setstatistics", commands::set_statistics),
    fixed(
        "CC",
        "Calculate cell size ranges.",
        "calculatecellsizeranges",
        "management.CalculateCellSizeRanges",
        Dataset,
        &[
            "where_clause",
            "do_compute_min",
            "do_compute_max",
            "max_range_factor",
            "cell_size_tolerance_factor",
            "update_missing_only",
        ],
    ),
    fixed(
        "BO",
        "Build overviews.",
        "buildoverviews",
        "management.BuildOverviews",
        Dataset,
        &[
            "where_clause",
            "define_missing_tiles",
            "generate_overviews",
            "generate_missing_images",
            "regenerate_stale_images",
        ],
    ),
    fixed(
        "DO",
        "Define overviews.",
        "defineoverviews",
        "management.DefineOverviews",
        Dataset,
        &[
            "overview_image_folder",
            "in_template_dataset",
            "extent",
            "pixel_size",
            "number_of_levels",
            "tile_rows",
            "tile_cols",
            "overview_factor",
            "force_overview_tiles",
            "resampling_method",
            "compression_method",
            "compression_quality",
        ],
    ),
    custom("AI", "Add attribute index.", "addindex", commands::add_index),
    fixed("RI", "Remove attribute index.", "removeindex", "management.RemoveIndex", Dataset, &["index_name"]),
    custom("CFC", "Create cache feature class.", "cachefeatureclass", commands::cache_feature_class),
    custom("CV", "Calculate values.", "calculatevalues", commands::calculate_values),
    custom("CP", "Compact file geodatabase.", "", commands::compact),
    dynamic("SY", "Synchronize mosaic dataset.", "synchronizemosaicdataset", "management.SynchronizeMosaicDataset", Dataset),
    custom("SE", "Set environment variables.", "", commands::set_environment),
    custom("MTC", "Manage tile cache.", "managetilecache", commands::manage_tile_cache),
    custom("ETC", "Export tile cache.", "exporttilecache", commands::export_tile_cache),
    fixed(
        "STP",
        "Share package.",
        "sharepackage",
        "management.SharePackage",
        Nothing,
        &["in_package", "username", "password", "summary", "tags", "credits", "public", "groups"],
    ),
    dynamic(
        "EMDG",
        "Export mosaic dataset geometry.",
        "exportmosaicdatasetgeometry",
        "management.ExportMosaicDatasetGeometry",
        Dataset,
    ),
    dynamic(
        "EMDI",
        "Export mosaic dataset items.",
        "exportmosaicdatasetitems",
        "management.ExportMosaicDatasetItems",
        Dataset,
    ),
    // Split reaches the merge tool; kept as configured setups expect it.
    dynamic(
        "SMDI",
        "Split mosaic dataset items.",
        "splitmosaicdatasetitems",
        "management.MergeMosaicDatasetItems",
        Dataset,
    ),
    dynamic(
        "CSDD",
        "Create an image service definition draft file.",
        "createimagesddraft",
        "CreateImageSDDraft",
        DatasetWhenOmitted,
    ),
    dynamic("STS", "Stage service.", "stageservice_server", "server.StageService", Nothing),
    dynamic(
        "USD",
        "Upload service definition.",
        "uploadservicedefinition_server",
        "server.UploadServiceDefinition",
        Nothing,
    ),
    dynamic("CRTT", "Clear raster type table.", "clearrastertypetable", "management.DeleteRows", RasterTypeTable),
    dynamic("CLT", "Clear logs table.", "clearlogstable", "management.DeleteRows", LogTable),
    dynamic("CCM", "Compute camera model.", "computecameramodel", "management.ComputeCameraModel", Dataset),
    dynamic("BSM", "Build stereo model.", "buildstereomodel", "management.BuildStereoModel", Dataset),
    dynamic("GPC", "Generate point cloud.", "generatepointcloud", "management.GeneratePointCloud", Dataset),
    dynamic(
        "IFPC",
        "Interpolate from point cloud.",
        "interpolatefrompointcloud",
        "management.InterpolateFromPointCloud",
        Nothing,
    ),
    dynamic("CRA", "Copy raster.", "copyraster", "management.CopyRaster", DatasetWhenOmitted),
    dynamic("DEL", "Delete.", "delete", "management.Delete", Nothing),
    custom("RR", "Register raster.", "registerraster", commands::register_raster),
    dynamic("BMI", "Build multidimensional info.", "buildmultidimensionalinfo", "management.BuildMultidimensionalInfo", Dataset),
    dynamic("AMR", "Aggregate multidimensional raster.", "aggregatemultidimensionalraster", "ia.AggregateMultidimensionalRaster", Nothing),
    dynamic("ACUC", "Apply cloud & cloud shadow mask.", "applycloudmask", "ia.ApplyCloudMask", Nothing),
    dynamic("DCUCAR", "Detect clouds using Cloud AI.", "detectcloudsusingcloudai", "ia.DetectCloudsUsingCloudAI", Nothing),
    dynamic("FAS", "Find argument statistics.", "findargumentstatistics", "ia.FindArgumentStatistics", Nothing),
    dynamic("GMA", "Generate multidimensional anomaly.", "generatemultidimensionalanomaly", "ia.GenerateMultidimensionalAnomaly", Nothing),
    dynamic("CF", "Calculate fields.", "calculatefields", "management.CalculateFields", Dataset),
    dynamic(
        "UIO",
        "Update interior orientation.",
        "updateinteriororientation",
        "management.UpdateInteriorOrientation",
        Dataset,
    ),
    dynamic(
        "EFACP",
        "Generate fiducial and compute points.",
        "computefiducialinfo",
        "management.ComputeFiducialInfo",
        Dataset,
    ),
    dynamic(
        "GBAR",
        "Generate block adjustment report.",
        "generateblockadjustmentreport",
        "management.GenerateBlockAdjustmentReport",
        Dataset,
    ),
    dynamic("GTR", "Generate trend raster.", "generatetrendraster", "ia.GenerateTrendRaster", Nothing),
    dynamic("PUTR", "Predict using trend raster.", "predictusingtrendraster", "ia.PredictUsingTrendRaster", Nothing),
    custom(
        "CPCSLP",
        "Create point cloud scene layer package.",
        "createpointcloudscenelayerpackage",
        commands::create_point_cloud_scene_layer_package,
    ),
    custom(
        "CPUDL",
        "Classify pixels using deep learning.",
        "classifypixelsusingdeeplearning",
        commands::classify_pixels_using_deep_learning,
    ),
    custom(
        "DOUDL",
        "Detect objects using deep learning.",
        "detectobjectsusingdeeplearning",
        commands::detect_objects_using_deep_learning,
    ),
    custom(
        "COUDL",
        "Classify objects using deep learning.",
        "classifyobjectsusingdeeplearning",
        commands::classify_objects_using_deep_learning,
    ),
    custom(
        "EFUAIM",
        "Extract features using AI models.",
        "extractfeaturesusingaimodels",
        commands::extract_features_using_ai_models,
    ),
    dynamic("CL", "Convert LAS.", "convertlas", "conversion.ConvertLas", Nothing),
    dynamic("CLAS", "Colorize LAS.", "colorizelas", "ddd.ColorizeLas", Nothing),
    dynamic("EL", "Extract LAS.", "extractlas", "ddd.ExtractLas", Nothing),
    dynamic(
        "CCSCF",
        "Create cloud storage connection file.",
        "createcloudstorageconnectionfile",
        "management.CreateCloudStorageConnectionFile",
        Nothing,
    ),
    custom("TF", "Transfer files.", "transferfiles", commands::transfer_files),
];

/// User commands discovered during one run, keyed by their original-case token.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    user: BTreeMap<String, String>,
}

impl Registry {
    /// Looks a built-in up by its upper-case code.
    pub fn builtin(code: &str) -> Option<&'static CommandDefinition> {
        BUILTIN_COMMANDS.iter().find(|c| c.code == code)
    }

    pub fn register_user(&mut self, token: &str) {
        self.user
            .entry(token.to_string())
            .or_insert_with(|| format!("User defined command ({token})"));
    }

    pub fn user_description(&self, token: &str) -> Option<&str> {
        self.user.get(token).map(String::as_str)
    }

    pub fn user_commands(&self) -> impl Iterator<Item = (&str, &str)> {
        self.user.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_codes_are_unique_and_upper_case() {
        let mut seen = HashSet::new();
        for def in BUILTIN_COMMANDS {
            assert!(seen.insert(def.code), "duplicate code {}", def.code);
            assert_eq!(def.code, def.code.to_uppercase());
            assert!(!def.desc.is_empty());
        }
    }

    #[test]
    fn test_builtin_lookup() {
        let bf = Registry::builtin("BF").unwrap();
        assert_eq!(bf.process_key, "buildfootprint");
        assert!(Registry::builtin("bf").is_none());
        assert!(matches!(
            Registry::builtin("SMDI").unwrap().handler,
            Handler::Dynamic { function: "management.MergeMosaicDatasetItems", .. }
        ));
    }

    #[test]
    fn test_dynamic_commands_carry_a_process_key() {
        for def in BUILTIN_COMMANDS {
            if matches!(def.handler, Handler::Dynamic { .. } | Handler::Fixed { .. }) {
                assert!(!def.process_key.is_empty(), "{} has no process key", def.code);
                assert_eq!(def.process_key, def.process_key.to_lowercase());
            }
        }
    }

    #[test]
    fn test_user_registration_keeps_original_case() {
        let mut registry = Registry::default();
        registry.register_user("customCV");
        assert_eq!(registry.user_description("customCV"), Some("User defined command (customCV)"));
        assert!(registry.user_description("CUSTOMCV").is_none());
        assert_eq!(registry.user_commands().count(), 1);
    }
}
