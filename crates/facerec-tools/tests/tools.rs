mod common;

use common::{assert_close, assert_score, compare_artifact, compare_file, compare_score};
use facerec_core::machine::{GmmMachine, IsvBase, JfaBase, LinearMachine};
use facerec_core::{read_artifact, Histogram, JetSimilarity};
use facerec_tools::bic::{BicConfig, BicTool};
use facerec_tools::gabor_jet::{GaborJetConfig, GaborJetTool};
use facerec_tools::gmm::{GmmParameters, UbmGmmTool};
use facerec_tools::gmm_regular::UbmGmmRegularTool;
use facerec_tools::isv::{IsvConfig, IsvTool};
use facerec_tools::jfa::{JfaConfig, JfaTool};
use facerec_tools::lda::{LdaConfig, LdaTool};
use facerec_tools::lgbphs::{LgbphsConfig, LgbphsTool};
use facerec_tools::pca::{PcaConfig, PcaTool, SubspaceDimension};
use facerec_tools::plda::{PldaConfig, PldaTool};
use facerec_tools::synthetic::{fixtures, train_gmm_stats, train_set, train_set_by_id};
use facerec_tools::{config, load_tool, Capabilities, Tool, ToolError, TrainingSet};
use ndarray::{Array1, Array2};
use tempfile::TempDir;

fn flags(projection: bool, projector: bool, projected_enroll: bool, by_client: bool, enroller: bool) -> Capabilities {
    Capabilities {
        performs_projection: projection,
        requires_projector_training: projector,
        use_projected_features_for_enrollment: projected_enroll,
        split_training_features_by_client: by_client,
        requires_enroller_training: enroller,
    }
}

fn scratch() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// UBM training frames shaped like the DCT block fixture.
fn gmm_training() -> Vec<Array2<f64>> {
    train_set(&Array2::zeros(fixtures::dct_blocks().raw_dim()), 5, -5.0, 5.0)
}

#[test]
fn test_resource_flags() {
    let expected = [
        ("gabor-jet", flags(false, false, false, false, false)),
        ("lgbphs", flags(false, false, false, false, false)),
        ("pca", flags(true, true, true, false, false)),
        ("lda", flags(true, true, true, true, false)),
        ("pca+lda", flags(true, true, true, true, false)),
        ("bic", flags(false, false, false, false, true)),
        ("iec", flags(false, false, false, false, true)),
        ("gmm", flags(true, true, false, false, false)),
        ("ubm_gmm_regular_scoring", flags(false, false, false, false, true)),
        ("isv", flags(true, true, true, false, true)),
        ("jfa", flags(true, true, true, false, true)),
        ("pca+plda", flags(false, false, false, false, true)),
    ];
    assert_eq!(config::tool_resource_names().count(), expected.len());
    for (name, caps) in expected {
        let tool = load_tool(name).unwrap();
        assert_eq!(tool.capabilities(), caps, "flags of {name}");
    }
}

#[test]
fn test_flags_independent_of_hyperparameters() {
    let pca = PcaTool::new(PcaConfig::new(SubspaceDimension::Count(10))).unwrap();
    assert_eq!(load_tool("pca").unwrap().capabilities(), pca.capabilities());
    let isv = IsvTool::new(IsvConfig {
        gmm: GmmParameters::reduced(2),
        subspace_dimension_of_u: 4,
        ..IsvConfig::default()
    })
    .unwrap();
    assert_eq!(load_tool("isv").unwrap().capabilities(), isv.capabilities());
}

#[test]
fn test_pca() {
    let dir = scratch();
    let mut tool = PcaTool::new(PcaConfig::new(SubspaceDimension::Count(10))).unwrap();
    let training = TrainingSet::Flat(train_set(&Array1::zeros(64), 400, 0.0, 255.0));
    let projector = dir.path().join("pca_projector.fra");
    tool.train_projector(&training, &projector).unwrap();
    compare_file(&projector, "pca_projector");

    let mut reloaded = PcaTool::new(PcaConfig::new(SubspaceDimension::Count(10))).unwrap();
    reloaded.load_projector(&projector).unwrap();
    assert!(reloaded.machine().unwrap().is_similar_to(tool.machine().unwrap(), 1e-5));

    let projected = reloaded.project(&fixtures::linearize()).unwrap();
    assert_eq!(projected.len(), 10);
    compare_artifact(&projected, "pca_feature");

    let feature_path = dir.path().join("feature.fra");
    reloaded.write_feature(&projected, &feature_path).unwrap();
    assert_eq!(reloaded.read_feature(&feature_path).unwrap(), projected);

    let model = reloaded.enroll(&[projected.clone()]).unwrap();
    assert_eq!(model, projected);
    assert_eq!(reloaded.score(&model, &projected).unwrap(), 0.0);
    assert_eq!(
        reloaded.score(&model, &projected).unwrap().to_bits(),
        reloaded.score(&model, &projected).unwrap().to_bits()
    );
}

#[test]
fn test_pca_lda() {
    let dir = scratch();
    let config = LdaConfig {
        lda_subspace_dimension: Some(5),
        pca_subspace_dimension: Some(SubspaceDimension::Count(10)),
        ..LdaConfig::default()
    };
    let mut tool = LdaTool::new(config.clone()).unwrap();
    let training = train_set_by_id(&Array1::zeros(64), 20, 0.0, 255.0);
    let projector = dir.path().join("lda_projector.fra");
    assert!(matches!(
        tool.train_projector(&TrainingSet::Flat(training.concat()), &projector),
        Err(ToolError::GroupingRequired(_))
    ));
    tool.train_projector(&TrainingSet::ByClient(training), &projector).unwrap();
    compare_file(&projector, "lda_projector");

    let mut reloaded = LdaTool::new(config).unwrap();
    reloaded.load_projector(&projector).unwrap();
    let machine: &LinearMachine = reloaded.machine().unwrap();
    assert_eq!((machine.input_size(), machine.output_size()), (64, 5));

    let projected = reloaded.project(&fixtures::linearize()).unwrap();
    compare_artifact(&projected, "lda_feature");
    let model = reloaded.enroll(&[projected.clone(), projected.mapv(|v| v + 2.0)]).unwrap();
    assert_close(&model, &projected.mapv(|v| v + 1.0));
    let model = reloaded.enroll(&[projected.clone()]).unwrap();
    assert_eq!(reloaded.score(&model, &projected).unwrap(), 0.0);
}

#[test]
fn test_gabor_jet() {
    let tool = GaborJetTool::new(GaborJetConfig {
        gabor_jet_similarity_type: JetSimilarity::PhaseDiffPlusCanberra,
    });
    let graph = fixtures::graph_with_phase().unwrap();
    let model = tool.enroll(&[graph.clone()]).unwrap();
    assert_eq!(model, vec![graph.clone()]);

    let dir = scratch();
    let model_path = dir.path().join("model.fra");
    tool.write_model(&model, &model_path).unwrap();
    let model = tool.read_model(&model_path).unwrap();
    assert_score(tool.score(&model, &graph).unwrap(), 1.0);
}

#[test]
fn test_lgbphs() {
    let tool = LgbphsTool::new(LgbphsConfig::default());
    let model = tool.enroll(&[fixtures::lgbphs_sparse().unwrap()]).unwrap();
    assert_eq!(model, vec![fixtures::lgbphs_sparse().unwrap()]);

    let dir = scratch();
    let probe_path = dir.path().join("probe.fra");
    let probe = fixtures::lgbphs_no_phase();
    tool.write_feature(&probe, &probe_path).unwrap();
    let probe: Histogram = tool.read_probe(&probe_path).unwrap();
    assert_score(tool.score(&model, &probe).unwrap(), 33600.0);
}

/// Train a UBM with the reduced GMM parameters, checking that the stored
/// projector reloads to the same machine.
fn trained_gmm(dir: &TempDir) -> UbmGmmTool {
    let projector = dir.path().join("gmm_projector.fra");
    let mut tool = UbmGmmTool::new(GmmParameters::reduced(2)).unwrap();
    tool.train_projector(&TrainingSet::Flat(gmm_training()), &projector)
        .unwrap();

    let mut reloaded = UbmGmmTool::new(GmmParameters::reduced(2)).unwrap();
    reloaded.load_projector(&projector).unwrap();
    assert_close(reloaded.ubm().unwrap(), tool.ubm().unwrap());
    reloaded
}

#[test]
fn test_ubm_gmm() {
    let dir = scratch();
    let tool = trained_gmm(&dir);
    compare_file(&dir.path().join("gmm_projector.fra"), "ubm_gmm_projector");

    let projected = tool.project(&fixtures::dct_blocks()).unwrap();
    assert_eq!(projected.t, 30);
    assert!((projected.n.sum() - 30.0).abs() < 1e-10);
    compare_artifact(&projected, "ubm_gmm_feature");
    let probe_path = dir.path().join("probe.fra");
    tool.write_feature(&projected, &probe_path).unwrap();
    let probe = tool.read_probe(&probe_path).unwrap();
    assert_close(&probe, &projected);

    // enrollment uses the raw frames
    let model = tool.enroll(&[fixtures::dct_blocks()]).unwrap();
    compare_artifact(&model, "ubm_gmm_model");
    let score = tool.score(&model, &probe).unwrap();
    assert!(score.is_finite());
    compare_score(score, "ubm_gmm_score");
    assert_eq!(score.to_bits(), tool.score(&model, &probe).unwrap().to_bits());
}

#[test]
fn test_ubm_gmm_regular() {
    let dir = scratch();
    let enroller = dir.path().join("gmm_enroller.fra");
    let mut tool = UbmGmmRegularTool::new(GmmParameters::reduced(2)).unwrap();
    tool.train_enroller(&TrainingSet::ByClient(vec![gmm_training()]), &enroller)
        .unwrap();
    compare_file(&enroller, "ubm_gmm_regular_enroller");

    // the enroller is the UBM the linear-scoring tool trains on the same frames
    let ubm = trained_gmm(&dir);
    let stored: GmmMachine = read_artifact(&enroller).unwrap();
    assert_close(&stored, ubm.ubm().unwrap());

    let mut reloaded = UbmGmmRegularTool::new(GmmParameters::reduced(2)).unwrap();
    reloaded.load_enroller(&enroller).unwrap();
    let model = reloaded.enroll(&[fixtures::dct_blocks()]).unwrap();
    compare_artifact(&model, "ubm_gmm_regular_model");
    assert_close(&model, &ubm.enroll(&[fixtures::dct_blocks()]).unwrap());

    let probe_path = dir.path().join("probe.fra");
    reloaded.write_feature(&fixtures::dct_blocks(), &probe_path).unwrap();
    let probe = reloaded.read_probe(&probe_path).unwrap();
    let score = reloaded.score(&model, &probe).unwrap();
    compare_score(score, "ubm_gmm_regular_score");

    // same UBM and model, linear scoring on the statistics
    let stats = ubm.project(&fixtures::dct_blocks()).unwrap();
    let linear_score = ubm.score(&model, &stats).unwrap();
    assert!((score - linear_score).abs() > 1e-6, "{score} == {linear_score}");
}

#[test]
fn test_isv() {
    let dir = scratch();
    let config = IsvConfig {
        gmm: GmmParameters::reduced(2),
        subspace_dimension_of_u: 160,
        isv_training_iterations: 1,
        ..IsvConfig::default()
    };
    let mut tool = IsvTool::new(config.clone()).unwrap();
    let projector = dir.path().join("isv_projector.fra");
    tool.train_projector(&TrainingSet::Flat(gmm_training()), &projector)
        .unwrap();
    compare_file(&projector, "isv_projector");

    let mut reloaded = IsvTool::new(config.clone()).unwrap();
    reloaded.load_projector(&projector).unwrap();
    assert_close(reloaded.ubm().unwrap(), tool.ubm().unwrap());
    let projected = reloaded.project(&fixtures::dct_blocks()).unwrap();
    assert_close(&projected, &tool.project(&fixtures::dct_blocks()).unwrap());
    compare_artifact(&projected, "isv_feature");

    let training = train_gmm_stats(&projected, 10, -5.0, 5.0);
    let enroller = dir.path().join("isv_enroller.fra");
    reloaded
        .train_enroller(&TrainingSet::ByClient(training), &enroller)
        .unwrap();
    compare_file(&enroller, "isv_enroller");

    // 160 exceeds the 2 x 6 supervector and is clamped to it
    let stored: IsvBase = read_artifact(&enroller).unwrap();
    assert_eq!(stored.u.dim(), (12, 12));
    assert_eq!(stored.d.len(), 12);

    let mut scorer = IsvTool::new(config).unwrap();
    scorer.load_projector(&projector).unwrap();
    scorer.load_enroller(&enroller).unwrap();
    assert_close(scorer.base().unwrap(), reloaded.base().unwrap());

    let model = scorer.enroll(&[projected.clone()]).unwrap();
    compare_artifact(&model, "isv_model");
    let model_path = dir.path().join("model.fra");
    scorer.write_model(&model, &model_path).unwrap();
    let model = scorer.read_model(&model_path).unwrap();
    let score = scorer.score(&model, &projected).unwrap();
    assert!(score.is_finite());
    compare_score(score, "isv_score");
}

#[test]
fn test_jfa() {
    let dir = scratch();
    let config = JfaConfig {
        gmm: GmmParameters::reduced(2),
        subspace_dimension_of_u: 2,
        subspace_dimension_of_v: 2,
        jfa_training_iterations: 1,
        ..JfaConfig::default()
    };
    let mut tool = JfaTool::new(config.clone()).unwrap();
    let projector = dir.path().join("jfa_projector.fra");
    tool.train_projector(&TrainingSet::Flat(gmm_training()), &projector)
        .unwrap();
    compare_file(&projector, "jfa_projector");

    let mut reloaded = JfaTool::new(config.clone()).unwrap();
    reloaded.load_projector(&projector).unwrap();
    assert_close(reloaded.ubm().unwrap(), tool.ubm().unwrap());
    let projected = reloaded.project(&fixtures::dct_blocks()).unwrap();
    compare_artifact(&projected, "jfa_feature");

    let training = train_gmm_stats(&projected, 10, -5.0, 5.0);
    let enroller = dir.path().join("jfa_enroller.fra");
    reloaded
        .train_enroller(&TrainingSet::ByClient(training), &enroller)
        .unwrap();
    compare_file(&enroller, "jfa_enroller");

    let stored: JfaBase = read_artifact(&enroller).unwrap();
    assert_eq!(stored.u.dim(), (12, 2));
    assert_eq!(stored.v.dim(), (12, 2));

    let mut scorer = JfaTool::new(config).unwrap();
    scorer.load_projector(&projector).unwrap();
    scorer.load_enroller(&enroller).unwrap();
    assert_close(scorer.base().unwrap(), reloaded.base().unwrap());

    let model = scorer.enroll(&[projected.clone()]).unwrap();
    compare_artifact(&model, "jfa_model");
    let score = scorer.score(&model, &projected).unwrap();
    assert!(score.is_finite());
    compare_score(score, "jfa_score");
}

#[test]
fn test_pca_plda() {
    let dir = scratch();
    let config = PldaConfig {
        subspace_dimension_of_f: 2,
        subspace_dimension_of_g: 2,
        subspace_dimension_pca: Some(10),
        plda_training_iterations: 1,
        ..PldaConfig::default()
    };
    let mut tool = PldaTool::new(config.clone()).unwrap();
    let training = train_set_by_id(&Array1::zeros(64), 20, 0.0, 255.0);
    let enroller = dir.path().join("plda_enroller.fra");
    tool.train_enroller(&TrainingSet::ByClient(training), &enroller).unwrap();
    compare_file(&enroller, "plda_enroller");

    let mut reloaded = PldaTool::new(config).unwrap();
    reloaded.load_enroller(&enroller).unwrap();
    assert_close(reloaded.base().unwrap(), tool.base().unwrap());
    assert_close(reloaded.pca().unwrap(), tool.pca().unwrap());

    let feature = fixtures::linearize();
    let model = reloaded.enroll(&[feature.clone()]).unwrap();
    compare_artifact(&model, "plda_model");
    compare_score(reloaded.score(&model, &feature).unwrap(), "plda_score");
}

fn check_bic(config: BicConfig, reference: &str) {
    let dir = scratch();
    let mut tool = BicTool::new(config.clone()).unwrap();
    let training = train_set_by_id(&Array1::zeros(64), 10, 0.0, 255.0);
    let enroller = dir.path().join("bic_enroller.fra");
    tool.train_enroller(&TrainingSet::ByClient(training), &enroller).unwrap();
    compare_file(&enroller, &format!("{reference}_enroller"));

    let mut reloaded = BicTool::new(config).unwrap();
    reloaded.load_enroller(&enroller).unwrap();
    assert_eq!(reloaded.machine(), tool.machine());

    let feature = fixtures::linearize();
    let model = reloaded.enroll(&[feature.clone()]).unwrap();
    compare_artifact(&model, &format!("{reference}_model"));
    let model_path = dir.path().join("model.fra");
    reloaded.write_model(&model, &model_path).unwrap();
    let model: Vec<Array1<f64>> = read_artifact(&model_path).unwrap();
    compare_score(reloaded.score(&model, &feature).unwrap(), &format!("{reference}_score"));
}

#[test]
fn test_bic() {
    check_bic(
        BicConfig {
            maximum_training_pair_count: Some(100),
            subspace_dimensions: Some((5, 7)),
            ..BicConfig::default()
        },
        "bic",
    );
}

#[test]
fn test_iec() {
    check_bic(
        BicConfig {
            maximum_training_pair_count: Some(100),
            ..BicConfig::default()
        },
        "iec",
    );
}

#[test]
fn test_stage_order_violations() {
    let mut pca = PcaTool::new(PcaConfig::new(SubspaceDimension::Count(2))).unwrap();
    assert!(matches!(
        pca.project(&fixtures::linearize()),
        Err(ToolError::NotReady { .. })
    ));
    let dir = scratch();
    assert!(matches!(
        pca.train_enroller(&TrainingSet::Flat(vec![]), &dir.path().join("e.fra")),
        Err(ToolError::StageNotSupported { .. })
    ));
    assert!(matches!(
        pca.train_projector(&TrainingSet::Flat(vec![]), &dir.path().join("p.fra")),
        Err(ToolError::EmptyTrainingSet(_))
    ));

    let mut lgbphs = LgbphsTool::new(LgbphsConfig::default());
    assert!(matches!(
        lgbphs.load_projector(&dir.path().join("p.fra")),
        Err(ToolError::StageNotSupported { .. })
    ));
}
