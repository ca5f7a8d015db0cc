//! FSM unit tests

use stackdeploy::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentPhase};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.phase(), DeploymentPhase::Idle);
    assert!(fsm.error().is_none());
    assert!(!fsm.is_verifying());
}

#[test]
fn test_fsm_deploy_success_flow() {
    let mut fsm = DeploymentFsm::new();

    // Idle -> Preparing
    fsm.process(DeploymentEvent::Start).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Preparing);

    // Preparing -> Cloning -> Configuring
    fsm.process(DeploymentEvent::Checked).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Cloning);
    fsm.process(DeploymentEvent::Cloned).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Configuring);

    // Configuring -> Preparing again, for tools and cluster
    fsm.process(DeploymentEvent::Configured).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Preparing);
    assert!(fsm.is_verifying());

    // Preparing -> Deploying -> Success
    fsm.process(DeploymentEvent::ClusterReady).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Deploying);
    fsm.process(DeploymentEvent::Completed).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Success);

    fsm.process(DeploymentEvent::Reset).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Idle);
}

#[test]
fn test_fsm_failure_records_error() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Checked).unwrap();

    fsm.process(DeploymentEvent::Fail("clone failed".to_string()))
        .unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Error);
    assert_eq!(fsm.error(), Some("clone failed"));

    // a failed run can only be reset
    assert!(fsm.process(DeploymentEvent::Checked).is_err());
    fsm.process(DeploymentEvent::Reset).unwrap();
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_cancel_from_any_running_phase() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Checked).unwrap();
    fsm.process(DeploymentEvent::Cloned).unwrap();

    fsm.process(DeploymentEvent::Cancel).unwrap();
    assert_eq!(fsm.phase(), DeploymentPhase::Idle);
    assert!(!fsm.is_verifying());
}

#[test]
fn test_fsm_rejects_out_of_order_events() {
    let mut fsm = DeploymentFsm::new();
    assert!(fsm.process(DeploymentEvent::Completed).is_err());
    assert!(fsm.process(DeploymentEvent::Fail("x".to_string())).is_err());

    fsm.process(DeploymentEvent::Start).unwrap();
    // cluster verification only follows configuration
    assert!(fsm.process(DeploymentEvent::ClusterReady).is_err());
    assert_eq!(fsm.phase(), DeploymentPhase::Preparing);
}
