mod test_fsm;
mod test_orchestrator;
mod test_session;
