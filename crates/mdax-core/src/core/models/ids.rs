use slotmap::new_key_type;

new_key_type! {
    /// Stable handle to a node (component or group) of the system hierarchy.
    pub struct SystemId;
    /// Stable handle to a registered input or output variable.
    pub struct VarId;
}
